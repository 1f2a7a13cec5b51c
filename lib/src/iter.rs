//! Iterators handed out by connections. Each holds a read lock for as long
//! as it is open; closing it (explicitly, by exhaustion or by dropping it)
//! gives the lock back.

use crate::dictionary::ValueDictionary;
use crate::error::Result;
use crate::index::Record;
use crate::lock::Lock;
use crate::term::{Statement, Term, ValueId, NULL_ID};
use crate::triple_store::RecordCursor;
use log::debug;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One index scan and the context term the caller asked for, if any.
pub(crate) struct ContextScan {
    pub cursor: RecordCursor,
    /// `Some(ctx)` when the context was bound by the caller; `ctx` is `None`
    /// for the default graph.
    pub context: Option<Option<Term>>,
}

/// Lazy, forward-only sequence of statements decoded from index records.
pub struct StatementIterator {
    dict: Arc<ValueDictionary>,
    scans: VecDeque<ContextScan>,
    /// Subject, predicate and object bound by the caller.
    bound: [Option<Term>; 3],
    peeked: Option<Result<Statement>>,
    lock: Option<Lock>,
    closed: bool,
    /// Failure flag of the owning connection.
    poisoned: Arc<AtomicBool>,
}

impl StatementIterator {
    pub(crate) fn new(
        dict: Arc<ValueDictionary>,
        scans: Vec<ContextScan>,
        bound: [Option<Term>; 3],
        lock: Lock,
        poisoned: Arc<AtomicBool>,
    ) -> Self {
        Self {
            dict,
            scans: scans.into(),
            bound,
            peeked: None,
            lock: Some(lock),
            closed: false,
            poisoned,
        }
    }

    fn term(&self, pos: usize, id: ValueId) -> Result<Term> {
        match &self.bound[pos] {
            Some(t) => Ok(t.clone()),
            None => self.dict.resolve(id),
        }
    }

    fn decode(&self, record: &Record, context: &Option<Option<Term>>) -> Result<Statement> {
        let ctx = match context {
            Some(ctx) => ctx.clone(),
            None if record.context() == NULL_ID => None,
            None => Some(self.dict.resolve(record.context())?),
        };
        Ok(Statement {
            subject: self.term(0, record.subject())?,
            predicate: self.term(1, record.predicate())?,
            object: self.term(2, record.object())?,
            context: ctx,
        })
    }

    fn advance(&mut self) -> Option<Result<Statement>> {
        while let Some(scan) = self.scans.front_mut() {
            match scan.cursor.next_record() {
                Ok(Some(record)) => {
                    let context = scan.context.clone();
                    return Some(self.decode(&record, &context));
                }
                Ok(None) => {
                    self.scans.pop_front();
                }
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }

    /// True if another statement is available. False forever once closed or
    /// exhausted.
    pub fn has_next(&mut self) -> bool {
        if self.closed {
            return false;
        }
        if self.peeked.is_none() {
            self.peeked = self.advance();
            match &self.peeked {
                None => self.close(),
                Some(Err(e)) if e.is_fatal() => self.poisoned.store(true, Ordering::Release),
                Some(_) => {}
            }
        }
        self.peeked.is_some()
    }

    /// Release the index cursors and the read lock. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for scan in self.scans.iter_mut() {
            scan.cursor.close();
        }
        self.scans.clear();
        if let Some(mut lock) = self.lock.take() {
            lock.release();
            debug!("Statement iterator closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Iterator for StatementIterator {
    type Item = Result<Statement>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.has_next() {
            return None;
        }
        let item = self.peeked.take();
        if matches!(item, Some(Err(_))) {
            // a damaged record ends the iteration
            self.close();
        }
        item
    }
}

impl Drop for StatementIterator {
    fn drop(&mut self) {
        self.close();
    }
}

/// Wraps any iterator and holds a read lock until it is exhausted, closed
/// or dropped.
pub struct LockingIter<I> {
    inner: Option<I>,
    lock: Option<Lock>,
}

impl<I: Iterator> LockingIter<I> {
    pub(crate) fn new(inner: I, lock: Lock) -> Self {
        Self {
            inner: Some(inner),
            lock: Some(lock),
        }
    }

    pub fn close(&mut self) {
        self.inner = None;
        if let Some(mut lock) = self.lock.take() {
            lock.release();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }
}

impl<I: Iterator> Iterator for LockingIter<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.inner.as_mut().and_then(|i| i.next());
        if item.is_none() {
            self.close();
        }
        item
    }
}
