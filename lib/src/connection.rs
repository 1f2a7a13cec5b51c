//! Transactional connections: the only way callers read or change a store.

use crate::error::{Result, StoreError};
use crate::index::{matches, IdPattern, Quad, Record, FLAG_EXPLICIT};
use crate::iter::{ContextScan, LockingIter, StatementIterator};
use crate::lock::Lock;
use crate::namespaces::Namespace;
use crate::options::{Inferred, Provenance};
use crate::store::{Engine, StoreChange};
use crate::term::{Statement, Term, ValueId, NULL_ID};
use crate::triple_store::{ApplyOutcome, Mutations, TripleStore};
use log::{debug, error, warn};
use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Context restriction of a read or target of a write.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Contexts {
    /// No restriction; writes go to the default graph.
    #[default]
    All,
    /// Listed contexts; `None` is the default graph. An empty list behaves
    /// like [`Contexts::All`].
    Only(Vec<Option<Term>>),
}

impl Contexts {
    pub fn default_graph() -> Self {
        Contexts::Only(vec![None])
    }

    pub fn named(context: Term) -> Self {
        Contexts::Only(vec![Some(context)])
    }

    pub fn is_all(&self) -> bool {
        match self {
            Contexts::All => true,
            Contexts::Only(list) => list.is_empty(),
        }
    }

    /// Distinct listed contexts, in first-seen order.
    fn listed(&self) -> Vec<Option<Term>> {
        let mut out: Vec<Option<Term>> = Vec::new();
        if let Contexts::Only(list) = self {
            for c in list {
                if !out.contains(c) {
                    out.push(c.clone());
                }
            }
        }
        out
    }
}

impl From<Term> for Contexts {
    fn from(context: Term) -> Self {
        Contexts::named(context)
    }
}

/// One position of a [`QuadPattern`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternTerm {
    Var(String),
    Const(Term),
}

impl PatternTerm {
    pub fn var(name: impl Into<String>) -> Self {
        PatternTerm::Var(name.into())
    }

    fn substitute(&self, bindings: &Bindings) -> Option<Term> {
        match self {
            PatternTerm::Const(t) => Some(t.clone()),
            PatternTerm::Var(v) => bindings.get(v).cloned(),
        }
    }
}

impl From<Term> for PatternTerm {
    fn from(t: Term) -> Self {
        PatternTerm::Const(t)
    }
}

/// A single statement pattern. A `context` of `None` matches every graph
/// without binding anything; a context variable only matches named graphs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuadPattern {
    pub subject: PatternTerm,
    pub predicate: PatternTerm,
    pub object: PatternTerm,
    pub context: Option<PatternTerm>,
}

/// Variable name to value.
pub type Bindings = BTreeMap<String, Term>;

/// Observer of the statements a connection's commits actually change.
pub trait ConnectionListener: Send + Sync {
    fn statement_added(&self, statement: &Statement);
    fn statement_removed(&self, statement: &Statement);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Active,
    Committing,
    RollingBack,
    /// An I/O or corruption error was observed; only `close` is allowed.
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Active => "active",
            ConnectionState::Committing => "committing",
            ConnectionState::RollingBack => "rolling back",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
enum PendingOp {
    Add {
        subject: Term,
        predicate: Term,
        object: Term,
        contexts: Contexts,
        provenance: Provenance,
    },
    Remove {
        subject: Option<Term>,
        predicate: Option<Term>,
        object: Option<Term>,
        contexts: Contexts,
        provenance: Provenance,
    },
    SetNamespace(String, String),
    RemoveNamespace(String),
    ClearNamespaces,
}

/// Pending changes layered over the committed records while a commit is
/// resolved. `None` marks a record as removed.
struct Overlay<'a> {
    triples: &'a Arc<TripleStore>,
    changes: BTreeMap<Quad, Option<u8>>,
}

impl<'a> Overlay<'a> {
    fn new(triples: &'a Arc<TripleStore>) -> Self {
        Self {
            triples,
            changes: BTreeMap::new(),
        }
    }

    fn current(&self, quad: &Quad) -> Result<Option<u8>> {
        match self.changes.get(quad) {
            Some(change) => Ok(*change),
            None => self.triples.get(quad),
        }
    }

    fn add(&mut self, quad: Quad, flags: u8) -> Result<()> {
        let merged = self.current(&quad)?.unwrap_or(0) | flags;
        self.changes.insert(quad, Some(merged));
        Ok(())
    }

    fn remove_matching(&mut self, pattern: IdPattern, provenance: Provenance) -> Result<()> {
        let wanted = |flags: u8| (flags & FLAG_EXPLICIT != 0) == provenance.is_explicit();
        let mut hits = Vec::new();
        for record in self.triples.scan(pattern, false)? {
            let record = record?;
            if !self.changes.contains_key(&record.quad) && wanted(record.flags) {
                hits.push(record.quad);
            }
        }
        for (quad, change) in &self.changes {
            if let Some(flags) = change {
                if matches(&pattern, quad) && wanted(*flags) {
                    hits.push(*quad);
                }
            }
        }
        for quad in hits {
            self.changes.insert(quad, None);
        }
        Ok(())
    }

    fn into_mutations(self) -> Result<Mutations> {
        let mut m = Mutations::default();
        for (quad, change) in self.changes {
            match (self.triples.get(&quad)?, change) {
                (Some(_), None) => m.removes.push(quad),
                (None, None) => {}
                (Some(old), Some(new)) if old == new => {}
                (Some(old), Some(new)) => {
                    // clearing a flag bit needs a fresh record
                    if old & !new != 0 {
                        m.removes.push(quad);
                    }
                    m.inserts.push(Record { quad, flags: new });
                }
                (None, Some(flags)) => m.inserts.push(Record { quad, flags }),
            }
        }
        Ok(m)
    }
}

/// Subjects and contexts must be resources and predicates IRIs.
fn check_terms(subject: &Term, predicate: &Term, contexts: &Contexts) -> Result<()> {
    if !subject.is_resource() {
        return Err(StoreError::InvalidTerm(format!(
            "subject must be an IRI or blank node, got {subject}"
        )));
    }
    if !predicate.is_iri() {
        return Err(StoreError::InvalidTerm(format!(
            "predicate must be an IRI, got {predicate}"
        )));
    }
    if let Contexts::Only(list) = contexts {
        if let Some(ctx) = list.iter().flatten().find(|c| !c.is_resource()) {
            return Err(StoreError::InvalidTerm(format!(
                "context must be an IRI or blank node, got {ctx}"
            )));
        }
    }
    Ok(())
}

/// A connection to an initialized [`crate::NativeStore`].
pub struct NativeStoreConnection {
    engine: Arc<Engine>,
    state: Cell<ConnectionState>,
    /// Raised by iterators of this connection that hit a fatal error.
    poisoned: Arc<AtomicBool>,
    pending: Vec<PendingOp>,
    txn_lock: Option<Lock>,
    listeners: Vec<Arc<dyn ConnectionListener>>,
}

impl NativeStoreConnection {
    pub(crate) fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            state: Cell::new(ConnectionState::Idle),
            poisoned: Arc::new(AtomicBool::new(false)),
            pending: Vec::new(),
            txn_lock: None,
            listeners: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        let state = self.state.get();
        if state != ConnectionState::Closed && self.poisoned.load(Ordering::Acquire) {
            self.state.set(ConnectionState::Failed);
            return ConnectionState::Failed;
        }
        state
    }

    pub fn is_open(&self) -> bool {
        self.state.get() != ConnectionState::Closed
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Closed => Err(StoreError::ConnectionClosed),
            ConnectionState::Failed => Err(StoreError::IllegalState(
                "connection failed after a storage error; close it".into(),
            )),
            _ => self.engine.ensure_running(),
        }
    }

    /// Put the connection into `Failed` if `result` carries a fatal error.
    fn check<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                error!("Connection failed: {e}");
                self.state.set(ConnectionState::Failed);
            }
        }
        result
    }

    pub fn add_connection_listener(&mut self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.push(listener);
    }

    pub fn remove_connection_listener(&mut self, listener: &Arc<dyn ConnectionListener>) {
        self.listeners.retain(|l| !Arc::ptr_eq(l, listener));
    }

    // ---------------- transactions ----------------

    /// Start a transaction, waiting for the store's transaction lock.
    pub fn begin(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.state.get() != ConnectionState::Idle {
            return Err(StoreError::IllegalState(format!(
                "cannot begin a transaction while {}",
                self.state.get()
            )));
        }
        self.txn_lock = Some(self.engine.locks.transaction_lock()?);
        self.state.set(ConnectionState::Active);
        debug!("Transaction started");
        Ok(())
    }

    fn push(&mut self, op: PendingOp) -> Result<()> {
        self.ensure_open()?;
        if self.state.get() == ConnectionState::Idle {
            self.begin()?;
        }
        self.pending.push(op);
        Ok(())
    }

    pub fn add_statement(
        &mut self,
        subject: &Term,
        predicate: &Term,
        object: &Term,
        contexts: &Contexts,
    ) -> Result<()> {
        check_terms(subject, predicate, contexts)?;
        self.push(PendingOp::Add {
            subject: subject.clone(),
            predicate: predicate.clone(),
            object: object.clone(),
            contexts: contexts.clone(),
            provenance: Provenance::Explicit,
        })
    }

    /// Add a statement derived by an inference layer.
    pub fn add_inferred_statement(
        &mut self,
        subject: &Term,
        predicate: &Term,
        object: &Term,
        contexts: &Contexts,
    ) -> Result<()> {
        check_terms(subject, predicate, contexts)?;
        self.push(PendingOp::Add {
            subject: subject.clone(),
            predicate: predicate.clone(),
            object: object.clone(),
            contexts: contexts.clone(),
            provenance: Provenance::Inferred,
        })
    }

    /// Remove explicit statements matching the pattern; `None` is a wildcard.
    pub fn remove_statements(
        &mut self,
        subject: Option<&Term>,
        predicate: Option<&Term>,
        object: Option<&Term>,
        contexts: &Contexts,
    ) -> Result<()> {
        self.push(PendingOp::Remove {
            subject: subject.cloned(),
            predicate: predicate.cloned(),
            object: object.cloned(),
            contexts: contexts.clone(),
            provenance: Provenance::Explicit,
        })
    }

    /// Remove inferred statements matching the pattern.
    pub fn remove_inferred_statements(
        &mut self,
        subject: Option<&Term>,
        predicate: Option<&Term>,
        object: Option<&Term>,
        contexts: &Contexts,
    ) -> Result<()> {
        self.push(PendingOp::Remove {
            subject: subject.cloned(),
            predicate: predicate.cloned(),
            object: object.cloned(),
            contexts: contexts.clone(),
            provenance: Provenance::Inferred,
        })
    }

    /// Remove every explicit statement in the given contexts.
    pub fn clear(&mut self, contexts: &Contexts) -> Result<()> {
        self.remove_statements(None, None, None, contexts)
    }

    pub fn set_namespace(&mut self, prefix: &str, name: &str) -> Result<()> {
        self.push(PendingOp::SetNamespace(prefix.to_string(), name.to_string()))
    }

    pub fn remove_namespace(&mut self, prefix: &str) -> Result<()> {
        self.push(PendingOp::RemoveNamespace(prefix.to_string()))
    }

    pub fn clear_namespaces(&mut self) -> Result<()> {
        self.push(PendingOp::ClearNamespaces)
    }

    /// Make the pending changes durable and visible. A no-op outside a
    /// transaction.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.state.get() != ConnectionState::Active {
            return Ok(());
        }
        self.state.set(ConnectionState::Committing);
        match self.apply_pending() {
            Ok(outcome) => {
                let ops = self.pending.len();
                self.pending.clear();
                if let Some(mut lock) = self.txn_lock.take() {
                    lock.release();
                }
                self.state.set(ConnectionState::Idle);
                debug!(
                    "Committed {ops} operations: {} added, {} removed",
                    outcome.added.len(),
                    outcome.removed.len()
                );
                self.notify(&outcome);
                Ok(())
            }
            Err(e) if e.is_fatal() => {
                error!("Commit failed: {e}");
                self.pending.clear();
                self.txn_lock = None;
                self.state.set(ConnectionState::Failed);
                Err(e)
            }
            Err(e) => {
                // still holding the transaction; caller may retry or roll back
                self.state.set(ConnectionState::Active);
                Err(e)
            }
        }
    }

    fn apply_pending(&self) -> Result<ApplyOutcome> {
        let engine = Arc::clone(&self.engine);
        let mut write = engine.locks.write_lock()?;

        let mut terms: Vec<Term> = Vec::new();
        for op in &self.pending {
            if let PendingOp::Add {
                subject,
                predicate,
                object,
                contexts,
                ..
            } = op
            {
                terms.extend([subject.clone(), predicate.clone(), object.clone()]);
                terms.extend(contexts.listed().into_iter().flatten());
            }
        }
        let ids = engine.dict.register_many(&terms)?;
        let ids: HashMap<Term, ValueId> = terms.into_iter().zip(ids).collect();
        engine.dict.sync()?;
        let id_of = |t: &Term| {
            ids.get(t)
                .copied()
                .ok_or_else(|| StoreError::corrupt(format!("term {t} was not registered")))
        };

        let mut overlay = Overlay::new(&engine.triples);
        let mut namespace_ops = Vec::new();
        for op in &self.pending {
            match op {
                PendingOp::Add {
                    subject,
                    predicate,
                    object,
                    contexts,
                    provenance,
                } => {
                    let (s, p, o) = (id_of(subject)?, id_of(predicate)?, id_of(object)?);
                    let flags = if provenance.is_explicit() { FLAG_EXPLICIT } else { 0 };
                    if contexts.is_all() {
                        overlay.add([s, p, o, NULL_ID], flags)?;
                    } else {
                        for ctx in contexts.listed() {
                            let c = match &ctx {
                                Some(t) => id_of(t)?,
                                None => NULL_ID,
                            };
                            overlay.add([s, p, o, c], flags)?;
                        }
                    }
                }
                PendingOp::Remove {
                    subject,
                    predicate,
                    object,
                    contexts,
                    provenance,
                } => {
                    let Some([s, p, o]) = self.lookup_spo(
                        subject.as_ref(),
                        predicate.as_ref(),
                        object.as_ref(),
                    )?
                    else {
                        continue;
                    };
                    match self.lookup_contexts(contexts)? {
                        None => overlay.remove_matching([s, p, o, None], *provenance)?,
                        Some(ctxs) => {
                            for (c, _) in ctxs {
                                overlay.remove_matching([s, p, o, Some(c)], *provenance)?;
                            }
                        }
                    }
                }
                ns => namespace_ops.push(ns.clone()),
            }
        }
        let mutations = overlay.into_mutations()?;
        let outcome = engine.triples.apply(&mutations)?;

        for op in namespace_ops {
            match op {
                PendingOp::SetNamespace(prefix, name) => engine.namespaces.set(&prefix, &name)?,
                PendingOp::RemoveNamespace(prefix) => engine.namespaces.remove(&prefix)?,
                PendingOp::ClearNamespaces => engine.namespaces.clear()?,
                _ => {}
            }
        }
        engine.namespaces.sync()?;
        write.release();
        Ok(outcome)
    }

    fn notify(&self, outcome: &ApplyOutcome) {
        if outcome.added.is_empty() && outcome.removed.is_empty() {
            return;
        }
        if !self.listeners.is_empty() {
            for (records, added) in [(&outcome.added, true), (&outcome.removed, false)] {
                for record in records {
                    match self.engine.statement(record) {
                        Ok(st) => {
                            for l in &self.listeners {
                                if added {
                                    l.statement_added(&st);
                                } else {
                                    l.statement_removed(&st);
                                }
                            }
                        }
                        Err(e) => warn!("Cannot report change of record {:?}: {e}", record.quad),
                    }
                }
            }
        }
        self.engine.notify(&StoreChange {
            statements_added: !outcome.added.is_empty(),
            statements_removed: !outcome.removed.is_empty(),
        });
    }

    /// Discard pending changes and end the transaction.
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.discard();
        Ok(())
    }

    fn discard(&mut self) {
        if self.state.get() != ConnectionState::Active {
            return;
        }
        self.state.set(ConnectionState::RollingBack);
        let dropped = self.pending.len();
        self.pending.clear();
        if let Some(mut lock) = self.txn_lock.take() {
            lock.release();
        }
        self.state.set(ConnectionState::Idle);
        debug!("Rolled back {dropped} pending operations");
    }

    /// Roll back any open transaction and close the connection. Safe to
    /// call repeatedly.
    pub fn close(&mut self) {
        if self.state.get() == ConnectionState::Closed {
            return;
        }
        self.discard();
        self.pending.clear();
        self.txn_lock = None;
        self.state.set(ConnectionState::Closed);
    }

    // ---------------- reads ----------------

    /// Ids of bound terms; `None` if any bound term was never registered,
    /// in which case nothing can match.
    fn lookup_spo(
        &self,
        subject: Option<&Term>,
        predicate: Option<&Term>,
        object: Option<&Term>,
    ) -> Result<Option<[Option<ValueId>; 3]>> {
        let mut out = [None; 3];
        for (slot, term) in out.iter_mut().zip([subject, predicate, object]) {
            if let Some(t) = term {
                match self.engine.dict.lookup(t)? {
                    Some(id) => *slot = Some(id),
                    None => return Ok(None),
                }
            }
        }
        Ok(Some(out))
    }

    /// `None` for no restriction; otherwise the known listed contexts.
    fn lookup_contexts(&self, contexts: &Contexts) -> Result<Option<Vec<(ValueId, Option<Term>)>>> {
        if contexts.is_all() {
            return Ok(None);
        }
        let mut out = Vec::new();
        for ctx in contexts.listed() {
            match &ctx {
                None => out.push((NULL_ID, None)),
                Some(t) => {
                    if let Some(id) = self.engine.dict.lookup(t)? {
                        out.push((id, ctx));
                    }
                }
            }
        }
        Ok(Some(out))
    }

    fn statements_locked(
        &self,
        subject: Option<&Term>,
        predicate: Option<&Term>,
        object: Option<&Term>,
        inferred: Inferred,
        contexts: &Contexts,
        lock: Lock,
    ) -> Result<StatementIterator> {
        let explicit_only = !inferred.includes_inferred();
        let bound = [subject.cloned(), predicate.cloned(), object.cloned()];
        let mut scans = Vec::new();
        if let Some([s, p, o]) = self.lookup_spo(subject, predicate, object)? {
            match self.lookup_contexts(contexts)? {
                None => scans.push(ContextScan {
                    cursor: self.engine.triples.scan([s, p, o, None], explicit_only)?,
                    context: None,
                }),
                Some(ctxs) => {
                    for (c, term) in ctxs {
                        scans.push(ContextScan {
                            cursor: self.engine.triples.scan([s, p, o, Some(c)], explicit_only)?,
                            context: Some(term),
                        });
                    }
                }
            }
        }
        Ok(StatementIterator::new(
            Arc::clone(&self.engine.dict),
            scans,
            bound,
            lock,
            Arc::clone(&self.poisoned),
        ))
    }

    /// Committed statements matching the pattern. The returned iterator
    /// holds a read lock until it is closed, exhausted or dropped.
    pub fn get_statements(
        &self,
        subject: Option<&Term>,
        predicate: Option<&Term>,
        object: Option<&Term>,
        inferred: Inferred,
        contexts: &Contexts,
    ) -> Result<StatementIterator> {
        self.ensure_open()?;
        let lock = self.engine.locks.read_lock()?;
        let result = self.statements_locked(subject, predicate, object, inferred, contexts, lock);
        self.check(result)
    }

    /// True if at least one committed statement matches.
    pub fn has_statement(
        &self,
        subject: Option<&Term>,
        predicate: Option<&Term>,
        object: Option<&Term>,
        inferred: Inferred,
        contexts: &Contexts,
    ) -> Result<bool> {
        let mut it = self.get_statements(subject, predicate, object, inferred, contexts)?;
        match it.next() {
            Some(Err(e)) => Err(e),
            Some(Ok(_)) => Ok(true),
            None => Ok(false),
        }
    }

    /// Solutions of a single quad pattern under `bindings`.
    pub fn evaluate(
        &self,
        pattern: &QuadPattern,
        bindings: &Bindings,
        inferred: Inferred,
    ) -> Result<Solutions> {
        let s = pattern.subject.substitute(bindings);
        let p = pattern.predicate.substitute(bindings);
        let o = pattern.object.substitute(bindings);
        let (contexts, needs_named) = match &pattern.context {
            None => (Contexts::All, false),
            Some(ctx) => match ctx.substitute(bindings) {
                Some(t) => (Contexts::named(t), false),
                None => (Contexts::All, true),
            },
        };
        let statements =
            self.get_statements(s.as_ref(), p.as_ref(), o.as_ref(), inferred, &contexts)?;
        Ok(Solutions {
            statements,
            pattern: pattern.clone(),
            base: bindings.clone(),
            needs_named,
        })
    }

    /// Named contexts holding at least one statement.
    pub fn context_ids(&self) -> Result<LockingIter<impl Iterator<Item = Result<Term>>>> {
        self.ensure_open()?;
        let lock = self.engine.locks.read_lock()?;
        let ids = self.check(self.engine.triples.context_ids())?;
        let dict = Arc::clone(&self.engine.dict);
        let poisoned = Arc::clone(&self.poisoned);
        Ok(LockingIter::new(
            ids.into_iter().map(move |id| {
                let term = dict.resolve(id);
                if matches!(&term, Err(e) if e.is_fatal()) {
                    poisoned.store(true, Ordering::Release);
                }
                term
            }),
            lock,
        ))
    }

    /// Number of committed statements in `contexts`; inferred statements
    /// are counted only under [`Inferred::Include`].
    pub fn size(&self, inferred: Inferred, contexts: &Contexts) -> Result<usize> {
        self.ensure_open()?;
        let _lock = self.engine.locks.read_lock()?;
        let explicit_only = !inferred.includes_inferred();
        let result = match self.lookup_contexts(contexts) {
            Ok(None) => self.engine.triples.size(None, explicit_only),
            Ok(Some(ctxs)) => {
                let ids: Vec<ValueId> = ctxs.into_iter().map(|(id, _)| id).collect();
                self.engine.triples.size(Some(&ids), explicit_only)
            }
            Err(e) => Err(e),
        };
        self.check(result)
    }

    /// Estimated number of statements matching the pattern.
    pub fn cardinality(
        &self,
        subject: Option<&Term>,
        predicate: Option<&Term>,
        object: Option<&Term>,
        contexts: &Contexts,
    ) -> Result<usize> {
        self.ensure_open()?;
        let _lock = self.engine.locks.read_lock()?;
        let result = self.cardinality_locked(subject, predicate, object, contexts);
        self.check(result)
    }

    fn cardinality_locked(
        &self,
        subject: Option<&Term>,
        predicate: Option<&Term>,
        object: Option<&Term>,
        contexts: &Contexts,
    ) -> Result<usize> {
        let Some([s, p, o]) = self.lookup_spo(subject, predicate, object)? else {
            return Ok(0);
        };
        match self.lookup_contexts(contexts)? {
            None => self.engine.triples.cardinality(&[s, p, o, None]),
            Some(ctxs) => {
                let mut total = 0;
                for (c, _) in ctxs {
                    total += self.engine.triples.cardinality(&[s, p, o, Some(c)])?;
                }
                Ok(total)
            }
        }
    }

    pub fn namespaces(&self) -> Result<LockingIter<std::vec::IntoIter<Namespace>>> {
        self.ensure_open()?;
        let lock = self.engine.locks.read_lock()?;
        let list = self.check(self.engine.namespaces.list())?;
        Ok(LockingIter::new(list.into_iter(), lock))
    }

    pub fn namespace(&self, prefix: &str) -> Result<Option<String>> {
        self.ensure_open()?;
        let _lock = self.engine.locks.read_lock()?;
        self.check(self.engine.namespaces.get(prefix))
    }
}

impl Drop for NativeStoreConnection {
    fn drop(&mut self) {
        if self.state.get() == ConnectionState::Active {
            warn!("Connection dropped with an open transaction; rolling back");
        }
        self.close();
    }
}

/// Lazy solutions of [`NativeStoreConnection::evaluate`]; holds the read
/// lock of its underlying statement scan.
pub struct Solutions {
    statements: StatementIterator,
    pattern: QuadPattern,
    base: Bindings,
    needs_named: bool,
}

impl Solutions {
    fn bind(&self, st: Statement) -> Option<Bindings> {
        if self.needs_named && st.context.is_none() {
            return None;
        }
        let mut out = self.base.clone();
        let slots = [
            (&self.pattern.subject, Some(st.subject)),
            (&self.pattern.predicate, Some(st.predicate)),
            (&self.pattern.object, Some(st.object)),
        ];
        let ctx_slot = self.pattern.context.as_ref().map(|c| (c, st.context));
        for (pt, value) in slots.into_iter().chain(ctx_slot) {
            let (PatternTerm::Var(name), Some(value)) = (pt, value) else {
                continue;
            };
            match out.get(name) {
                Some(existing) if *existing != value => return None,
                Some(_) => {}
                None => {
                    out.insert(name.clone(), value);
                }
            }
        }
        Some(out)
    }

    pub fn close(&mut self) {
        self.statements.close();
    }
}

impl Iterator for Solutions {
    type Item = Result<Bindings>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.statements.next()? {
                Ok(st) => {
                    if let Some(b) = self.bind(st) {
                        return Some(Ok(b));
                    }
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
