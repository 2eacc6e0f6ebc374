//! Mail store facade. Owns the uid/uidvalidity/mailbox-id sequences and
//! the authoritative message records on disk, and drives an injected
//! search backend for everything else.

use std::collections::BTreeMap;
use std::fs;

use chrono::Utc;
use parking_lot::Mutex;

use crate::backend::{Backend, OpenMode};
use crate::core::config::Config;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{MailData, Uid};
use crate::query::Query;
use crate::storage::file_lock::FileLock;
use crate::storage::{Sequence, StorageLayout};

pub struct MailStore {
    config: Config,
    layout: StorageLayout,
    uid_seq: Sequence,
    uidvalidity_seq: Sequence,
    mailbox_id_seq: Sequence,
    inner: Mutex<StoreInner>,
}

struct StoreInner {
    backend: Box<dyn Backend>,
    open_count: u32,
}

/// Exclusive access to the store for the duration of one `synchronize`
/// region. All mutating and querying operations live here so they can
/// only run while the in-process mutex and the cross-process file lock
/// are both held and the backend is on standby.
pub struct StoreSession<'a> {
    store: &'a MailStore,
    inner: &'a mut StoreInner,
}

impl MailStore {
    pub fn new(config: Config, backend: Box<dyn Backend>) -> Result<MailStore> {
        let layout = StorageLayout::new(&config.data_dir)?;
        let uid_seq = Sequence::with_initial_value(layout.uid_seq_path(), config.initial_uid);
        let uidvalidity_seq = Sequence::with_initial_value(
            layout.uidvalidity_seq_path(),
            config.initial_uidvalidity,
        );
        let mailbox_id_seq = Sequence::with_initial_value(
            layout.mailbox_id_seq_path(),
            config.initial_mailbox_id,
        );
        let store = MailStore {
            config,
            layout,
            uid_seq,
            uidvalidity_seq,
            mailbox_id_seq,
            inner: Mutex::new(StoreInner {
                backend,
                open_count: 0,
            }),
        };
        store.synchronize(|session| session.initialize())?;
        Ok(store)
    }

    /// Run `f` inside the store region: in-process mutex, cross-process
    /// file lock, backend standby on entry and relax on exit. Not
    /// re-entrant; nest work on the session instead.
    pub fn synchronize<R>(&self, f: impl FnOnce(&mut StoreSession) -> Result<R>) -> Result<R> {
        let mut inner = self.inner.lock();
        let _lock = FileLock::acquire(&self.layout.lock_path(), true)?;
        inner.backend.standby()?;
        let result = {
            let mut session = StoreSession {
                store: self,
                inner: &mut inner,
            };
            f(&mut session)
        };
        let relaxed = inner.backend.relax();
        match result {
            Err(e) => Err(e),
            Ok(value) => relaxed.map(|_| value),
        }
    }

    pub fn import(
        &self,
        text: &str,
        attributes: BTreeMap<String, String>,
        flags: &str,
    ) -> Result<Uid> {
        self.synchronize(|session| session.import(text, attributes, flags))
    }

    pub fn uid_search(&self, query: &Query) -> Result<Vec<Uid>> {
        self.synchronize(|session| session.uid_search(query))
    }

    pub fn uid_search_text(&self, text: &str) -> Result<Vec<Uid>> {
        let query = Query::parse(text)?;
        self.uid_search(&query)
    }

    pub fn get_flags(&self, uid: Uid) -> Result<String> {
        self.synchronize(|session| session.get_flags(uid))
    }

    pub fn set_flags(&self, uid: Uid, flags: &str) -> Result<()> {
        self.synchronize(|session| session.set_flags(uid, flags))
    }

    pub fn delete_flags(&self, uid: Uid) -> Result<()> {
        self.synchronize(|session| session.delete_flags(uid))
    }

    pub fn delete(&self, uid: Uid) -> Result<()> {
        self.synchronize(|session| session.delete(uid))
    }

    pub fn rebuild_index(&self) -> Result<()> {
        self.synchronize(|session| session.rebuild_index())
    }

    pub fn next_mailbox_id(&self) -> Result<u64> {
        self.synchronize(|session| session.next_mailbox_id())
    }

    pub fn uid_validity(&self) -> Result<u64> {
        self.synchronize(|session| session.uid_validity())
    }

    pub fn peek_next_uid(&self) -> Result<Uid> {
        self.synchronize(|session| session.peek_next_uid())
    }
}

impl StoreSession<'_> {
    /// First-use seeding: uidvalidity and mailbox-id counters get their
    /// configured starting values, then the backend creates its index.
    fn initialize(&mut self) -> Result<()> {
        if self.store.uidvalidity_seq.current()?.is_none() {
            self.store
                .uidvalidity_seq
                .set_current(self.store.config.initial_uidvalidity)?;
        }
        if self.store.mailbox_id_seq.current()?.is_none() {
            self.store
                .mailbox_id_seq
                .set_current(self.store.config.initial_mailbox_id)?;
        }
        self.inner.backend.setup()
    }

    /// Run `f` with the backend index open. Nested calls share one
    /// physical open; the index is closed when the outermost caller
    /// finishes, on success and on error alike.
    pub fn open_backend<R>(
        &mut self,
        mode: OpenMode,
        f: impl FnOnce(&mut dyn Backend) -> Result<R>,
    ) -> Result<R> {
        if self.inner.open_count == 0 {
            self.inner.backend.open(mode)?;
        }
        self.inner.open_count += 1;
        let result = f(self.inner.backend.as_mut());
        self.inner.open_count -= 1;
        if self.inner.open_count == 0 {
            let closed = self.inner.backend.close();
            if result.is_ok() {
                closed?;
            }
        }
        result
    }

    /// Allocate the next uid, persist the authoritative record, and
    /// register the message with the backend. `internal-date` and `size`
    /// are stamped unless the caller supplied them.
    pub fn import(
        &mut self,
        text: &str,
        attributes: BTreeMap<String, String>,
        flags: &str,
    ) -> Result<Uid> {
        let uid = self.store.uid_seq.next()?;
        let size = text.len();
        let mut mail = MailData {
            uid,
            text: text.to_string(),
            attributes,
            flags: flags.to_string(),
        };
        mail.attributes
            .entry("internal-date".to_string())
            .or_insert_with(|| Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string());
        mail.attributes
            .entry("size".to_string())
            .or_insert_with(|| size.to_string());
        let data = bincode::serialize(&mail)?;
        fs::write(self.store.layout.record_path(uid), data)?;
        self.open_backend(OpenMode::ReadWrite, |backend| backend.register(&mail))?;
        log::debug!("imported message uid {}", uid);
        Ok(uid)
    }

    pub fn uid_search(&mut self, query: &Query) -> Result<Vec<Uid>> {
        self.open_backend(OpenMode::ReadWrite, |backend| backend.uid_search(query))
    }

    pub fn get_flags(&mut self, uid: Uid) -> Result<String> {
        self.open_backend(OpenMode::ReadWrite, |backend| backend.get_flags(uid))
    }

    pub fn set_flags(&mut self, uid: Uid, flags: &str) -> Result<()> {
        self.open_backend(OpenMode::ReadWrite, |backend| backend.set_flags(uid, flags))
    }

    pub fn delete_flags(&mut self, uid: Uid) -> Result<()> {
        self.open_backend(OpenMode::ReadWrite, |backend| backend.delete_flags(uid))
    }

    /// Drop a message from the backend and remove its record
    pub fn delete(&mut self, uid: Uid) -> Result<()> {
        self.open_backend(OpenMode::ReadWrite, |backend| backend.delete(uid))?;
        fs::remove_file(self.store.layout.record_path(uid))?;
        Ok(())
    }

    /// Rebuild the backend index from the authoritative records, replayed
    /// in uid order. In-index flags win over recorded flags when the
    /// pre-rebuild shadow still knows the uid. A successful rebuild bumps
    /// uidvalidity.
    pub fn rebuild_index(&mut self) -> Result<()> {
        log::info!("rebuilding index");
        let layout = self.store.layout.clone();
        let mut uids = Vec::new();
        for entry in fs::read_dir(&layout.records_dir)? {
            let name = entry?.file_name();
            if let Some(stem) = name.to_string_lossy().strip_suffix(".bin") {
                if let Ok(uid) = stem.parse::<Uid>() {
                    uids.push(uid);
                }
            }
        }
        uids.sort_unstable();
        self.inner
            .backend
            .rebuild(OpenMode::ReadWrite, &mut |backend| {
                for &uid in &uids {
                    let data = fs::read(layout.record_path(uid))?;
                    let mut mail: MailData = bincode::deserialize(&data)?;
                    if let Ok(flags) = backend.get_old_flags(uid) {
                        mail.flags = flags;
                    }
                    backend.register(&mail)?;
                }
                Ok(())
            })?;
        let validity = self.store.uidvalidity_seq.next()?;
        log::info!("rebuilt index, uidvalidity is now {}", validity);
        Ok(())
    }

    pub fn next_mailbox_id(&mut self) -> Result<u64> {
        self.store.mailbox_id_seq.next()
    }

    pub fn uid_validity(&mut self) -> Result<u64> {
        self.store
            .uidvalidity_seq
            .current()?
            .ok_or_else(|| Error::new(ErrorKind::Internal, "uidvalidity is not seeded"))
    }

    pub fn peek_next_uid(&mut self) -> Result<Uid> {
        self.store.uid_seq.peek_next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AttrBackend, InfixBackend};
    use std::path::Path;
    use tempfile::tempdir;

    fn attr_store(dir: &Path) -> MailStore {
        let layout = StorageLayout::new(dir).unwrap();
        MailStore::new(Config::new(dir), Box::new(AttrBackend::new(&layout))).unwrap()
    }

    fn infix_store(dir: &Path) -> MailStore {
        let layout = StorageLayout::new(dir).unwrap();
        MailStore::new(Config::new(dir), Box::new(InfixBackend::new(&layout))).unwrap()
    }

    fn subject(value: &str) -> BTreeMap<String, String> {
        let mut attributes = BTreeMap::new();
        attributes.insert("subject".to_string(), value.to_string());
        attributes
    }

    fn each_store(test: impl Fn(MailStore)) {
        let dir = tempdir().unwrap();
        test(attr_store(dir.path()));
        let dir = tempdir().unwrap();
        test(infix_store(dir.path()));
    }

    #[test]
    fn test_import_and_search_across_messages() {
        each_store(|store| {
            let uid1 = store.import("hello", subject("hello"), "").unwrap();
            let uid2 = store.import("bye", subject("bye"), "").unwrap();
            assert_eq!(uid1, 1);
            assert_eq!(uid2, 2);

            let uids = store
                .uid_search_text("subject : hello | subject : bye")
                .unwrap();
            assert_eq!(uids, vec![1, 2]);
            assert_eq!(store.uid_search_text("subject : hello").unwrap(), vec![1]);
            assert_eq!(store.uid_search_text("nothing").unwrap(), Vec::<Uid>::new());
        });
    }

    #[test]
    fn test_import_stamps_internal_date_and_size() {
        each_store(|store| {
            let uid = store.import("hello world", subject("x"), "").unwrap();
            let data = fs::read(store.layout.record_path(uid)).unwrap();
            let mail: MailData = bincode::deserialize(&data).unwrap();
            assert_eq!(mail.attributes["size"], "11");
            assert!(mail.attributes.contains_key("internal-date"));
        });
    }

    #[test]
    fn test_flag_operations() {
        each_store(|store| {
            let uid = store.import("hello", subject("x"), r"\Recent").unwrap();
            assert_eq!(store.get_flags(uid).unwrap(), r"\Recent");
            store.set_flags(uid, r"\Seen \Answered").unwrap();
            assert_eq!(store.get_flags(uid).unwrap(), r"\Seen \Answered");
            assert_eq!(store.uid_search_text(r"flag : \Seen").unwrap(), vec![uid]);
            store.delete_flags(uid).unwrap();
            assert_eq!(store.get_flags(uid).unwrap(), "");
        });
    }

    #[test]
    fn test_delete_removes_record_and_search_hit() {
        each_store(|store| {
            let uid1 = store.import("hello", subject("x"), "").unwrap();
            let uid2 = store.import("hello", subject("x"), "").unwrap();
            store.delete(uid1).unwrap();
            assert!(!store.layout.record_path(uid1).exists());
            assert_eq!(store.uid_search_text("hello").unwrap(), vec![uid2]);
        });
    }

    #[test]
    fn test_rebuild_preserves_messages_and_flags() {
        each_store(|store| {
            let uid1 = store.import("hello", subject("hello"), "").unwrap();
            let uid2 = store.import("bye", subject("bye"), "").unwrap();
            store.set_flags(uid1, r"\Seen").unwrap();
            assert_eq!(store.uid_validity().unwrap(), 1);

            store.rebuild_index().unwrap();

            assert_eq!(store.uid_validity().unwrap(), 2);
            assert_eq!(store.uid_search_text("hello | bye").unwrap(), vec![uid1, uid2]);
            assert_eq!(store.get_flags(uid1).unwrap(), r"\Seen");
            assert_eq!(store.get_flags(uid2).unwrap(), "");
            assert!(!store.config.data_dir.join("index.old").exists());
        });
    }

    #[test]
    fn test_counters_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = attr_store(dir.path());
            store.import("one", subject("x"), "").unwrap();
            assert_eq!(store.next_mailbox_id().unwrap(), 1);
        }
        let store = attr_store(dir.path());
        assert_eq!(store.peek_next_uid().unwrap(), 2);
        assert_eq!(store.next_mailbox_id().unwrap(), 2);
        assert_eq!(store.uid_validity().unwrap(), 1);
    }

    #[test]
    fn test_session_batches_operations_in_one_region() {
        let dir = tempdir().unwrap();
        let store = attr_store(dir.path());
        let uids = store
            .synchronize(|session| {
                session.import("hello", subject("hello"), "")?;
                session.import("bye", subject("bye"), "")?;
                session.uid_search(&Query::parse("subject : hello | subject : bye").unwrap())
            })
            .unwrap();
        assert_eq!(uids, vec![1, 2]);
    }

    #[test]
    fn test_invalid_query_surfaces_from_search() {
        each_store(|store| {
            store.import("hello", subject("x"), "").unwrap();
            let err = store.uid_search_text("subject > foo").unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidQuery);
        });
    }
}
