//! RDF term and statement model used at the connection boundary.

use std::fmt;

/// Numeric identifier assigned to a registered term. `0` is reserved for the
/// absent value (the default context).
pub type ValueId = u32;

/// Reserved id standing for "no value" (default graph context).
pub const NULL_ID: ValueId = 0;

/// RDF term as stored in the value dictionary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Term {
    /// IRI/URI node.
    Iri(String),
    /// Blank node label, without the `_:` prefix.
    BNode(String),
    Literal { label: String, kind: LiteralKind },
}

/// What qualifies a literal's label: nothing, a language tag, or a
/// datatype IRI. A literal never carries both.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LiteralKind {
    Plain,
    Lang(String),
    Typed(String),
}

impl Term {
    pub fn iri(iri: impl Into<String>) -> Self {
        Term::Iri(iri.into())
    }

    pub fn bnode(id: impl Into<String>) -> Self {
        Term::BNode(id.into())
    }

    /// Plain literal with neither language nor datatype.
    pub fn literal(label: impl Into<String>) -> Self {
        Term::Literal {
            label: label.into(),
            kind: LiteralKind::Plain,
        }
    }

    pub fn lang_literal(label: impl Into<String>, language: impl Into<String>) -> Self {
        Term::Literal {
            label: label.into(),
            kind: LiteralKind::Lang(language.into()),
        }
    }

    pub fn typed_literal(label: impl Into<String>, datatype: impl Into<String>) -> Self {
        Term::Literal {
            label: label.into(),
            kind: LiteralKind::Typed(datatype.into()),
        }
    }

    pub fn is_iri(&self) -> bool {
        matches!(self, Term::Iri(_))
    }

    pub fn is_bnode(&self) -> bool {
        matches!(self, Term::BNode(_))
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Term::Literal { .. })
    }

    /// Terms that may appear in the subject or context position.
    pub fn is_resource(&self) -> bool {
        !self.is_literal()
    }

    pub fn language(&self) -> Option<&str> {
        match self {
            Term::Literal {
                kind: LiteralKind::Lang(lang),
                ..
            } => Some(lang),
            _ => None,
        }
    }

    pub fn datatype(&self) -> Option<&str> {
        match self {
            Term::Literal {
                kind: LiteralKind::Typed(dt),
                ..
            } => Some(dt),
            _ => None,
        }
    }
}

fn write_escaped(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    for c in s.chars() {
        match c {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\r' => f.write_str("\\r")?,
            '\t' => f.write_str("\\t")?,
            c => write!(f, "{c}")?,
        }
    }
    Ok(())
}

/// N-Triples style rendering, used by the CLI dump and in log messages.
impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Iri(iri) => write!(f, "<{iri}>"),
            Term::BNode(id) => write!(f, "_:{id}"),
            Term::Literal { label, kind } => {
                f.write_str("\"")?;
                write_escaped(f, label)?;
                f.write_str("\"")?;
                match kind {
                    LiteralKind::Plain => Ok(()),
                    LiteralKind::Lang(lang) => write!(f, "@{lang}"),
                    LiteralKind::Typed(dt) => write!(f, "^^<{dt}>"),
                }
            }
        }
    }
}

/// A triple plus its optional named-graph context (`None` is the default graph).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Statement {
    pub subject: Term,
    pub predicate: Term,
    pub object: Term,
    pub context: Option<Term>,
}

impl Statement {
    pub fn new(subject: Term, predicate: Term, object: Term, context: Option<Term>) -> Self {
        Self {
            subject,
            predicate,
            object,
            context,
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.subject, self.predicate, self.object)?;
        if let Some(ctx) = &self.context {
            write!(f, " {ctx}")?;
        }
        f.write_str(" .")
    }
}

// ---------------- Oxigraph helpers ----------------

#[cfg(feature = "oxigraph")]
impl From<oxigraph::model::TermRef<'_>> for Term {
    fn from(t: oxigraph::model::TermRef<'_>) -> Self {
        use oxigraph::model::vocab::xsd;
        use oxigraph::model::TermRef as TR;
        match t {
            TR::NamedNode(n) => Term::Iri(n.as_str().to_string()),
            TR::BlankNode(b) => Term::BNode(b.as_str().to_string()),
            TR::Literal(l) => {
                let label = l.value().to_string();
                if let Some(lang) = l.language() {
                    Term::lang_literal(label, lang)
                } else if l.datatype() == xsd::STRING {
                    Term::literal(label)
                } else {
                    Term::typed_literal(label, l.datatype().as_str())
                }
            }
            #[allow(unreachable_patterns)]
            _ => Term::Iri(t.to_string()),
        }
    }
}

#[cfg(feature = "oxigraph")]
impl From<&Term> for oxigraph::model::Term {
    fn from(t: &Term) -> Self {
        use oxigraph::model::{BlankNode, Literal, NamedNode};
        match t {
            Term::Iri(iri) => NamedNode::new_unchecked(iri.clone()).into(),
            Term::BNode(id) => BlankNode::new_unchecked(id.clone()).into(),
            Term::Literal { label, kind } => match kind {
                LiteralKind::Plain => Literal::new_simple_literal(label.clone()).into(),
                LiteralKind::Lang(lang) => {
                    Literal::new_language_tagged_literal_unchecked(label.clone(), lang.clone())
                        .into()
                }
                LiteralKind::Typed(dt) => {
                    Literal::new_typed_literal(label.clone(), NamedNode::new_unchecked(dt.clone()))
                        .into()
                }
            },
        }
    }
}
