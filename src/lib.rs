pub mod core;
pub mod query;
pub mod storage;
pub mod backend;
pub mod store;

pub use crate::backend::{AttrBackend, Backend, InfixBackend, OpenMode};
pub use crate::core::config::Config;
pub use crate::core::error::{Error, ErrorKind, Result};
pub use crate::core::types::{DocId, MailData, Uid};
pub use crate::query::Query;
pub use crate::store::MailStore;

/*
┌──────────────────────────────── MAILIDX ARCHITECTURE ────────────────────────────────┐
│                                                                                      │
│  struct MailStore                          region: Mutex + file lock + standby/relax │
│  ├ config: Config                                                                    │
│  ├ layout: StorageLayout                   index/ index.old/ records/ *.seq lock     │
│  ├ uid_seq / uidvalidity_seq /             crash-safe counters (tmp → .new → write)  │
│  │ mailbox_id_seq: Sequence                                                          │
│  └ backend: Box<dyn Backend>               injected; index open refcounted           │
│                                                                                      │
│  enum Query                                Null | Term | Property | Flag | NoFlag    │
│   parse ─ QueryParser                      | Composite { op, operands }              │
│   merge ─ Null identity, same-op append                                              │
│                                                                                      │
│  trait Backend ── AttrBackend              phrase AND/OR/ANDNOT + `name OP value`    │
│              └─── InfixBackend             phrase &/|/- + `name op "value"`, flags.db│
│   compile ─ CompileError::Unsupported      → executor decomposes on the top operator │
│   rebuild ─ rename to .old, replay         records, get_old_flags, drop shadow      │
│                                                                                      │
└──────────────────────────────────────────────────────────────────────────────────────┘
*/
