//! A disk-resident RDF quad store.
//!
//! Terms are interned into a [`dictionary::ValueDictionary`], statements are
//! kept as fixed-size id quads in one or more paged B+tree indexes
//! ([`triple_store::TripleStore`]), and all reads and writes go through a
//! [`NativeStoreConnection`] obtained from an initialized [`NativeStore`].
//!
//! ```no_run
//! use nativestore::{Contexts, Inferred, NativeStore, Term};
//!
//! # fn main() -> nativestore::Result<()> {
//! let store = NativeStore::with_data_dir("/tmp/quads");
//! store.set_triple_indexes("spoc,posc")?;
//! store.initialize()?;
//!
//! let mut conn = store.connection()?;
//! let alice = Term::iri("http://example.org/alice");
//! let name = Term::iri("http://xmlns.com/foaf/0.1/name");
//! conn.add_statement(&alice, &name, &Term::literal("Alice"), &Contexts::All)?;
//! conn.commit()?;
//!
//! for st in conn.get_statements(Some(&alice), None, None, Inferred::Include, &Contexts::All)? {
//!     println!("{}", st?);
//! }
//! # Ok(())
//! # }
//! ```

extern crate derive_builder;

pub mod btree;
pub mod cache;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dictionary;
pub mod dirlock;
pub mod error;
pub mod index;
pub mod iter;
pub mod journal;
pub mod lock;
pub mod namespaces;
pub mod options;
pub mod page;
pub mod store;
pub mod term;
pub mod triple_store;

pub use config::{StoreConfig, StoreConfigBuilder};
pub use connection::{
    Bindings, ConnectionListener, ConnectionState, Contexts, NativeStoreConnection, PatternTerm,
    QuadPattern, Solutions,
};
pub use error::{Result, StoreError};
pub use iter::{LockingIter, StatementIterator};
pub use lock::{LockInfo, LockKind};
pub use namespaces::Namespace;
pub use options::{Inferred, SyncMode};
pub use store::{IndexStats, NativeStore, StoreChange, StoreListener, StoreStats, VerifyReport};
pub use term::{LiteralKind, Statement, Term};

/// Honour `NATIVESTORE_LOG` as an override of `RUST_LOG`. Call before
/// installing a logger.
pub fn init_logging() {
    if let Ok(log_level) = std::env::var("NATIVESTORE_LOG") {
        std::env::set_var("RUST_LOG", log_level);
    }
}
