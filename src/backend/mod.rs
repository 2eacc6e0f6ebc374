pub mod attr;
pub mod infix;

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::fs;
use std::hash::Hash;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{DocId, MailData, Uid};
use crate::query::{Operator, Query};

pub use attr::AttrBackend;
pub use infix::InfixBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadWrite,
    ReadOnly,
}

/// Why a query tree could not be turned into a backend condition.
///
/// `Unsupported` is a control signal consumed by the executor's
/// decomposition fallback; it never converts into the public error type
/// and never reaches a caller. `Invalid` is a user error and surfaces.
#[derive(Debug)]
pub enum CompileError {
    Unsupported(&'static str),
    Invalid(Error),
}

pub type CompileResult<T> = std::result::Result<T, CompileError>;

/// Search/storage engine contract consumed by the mail store.
///
/// `compile` and `search` are inherent to each implementation because the
/// compiled condition type is backend-owned; the trait surfaces the
/// executor through `uid_search`.
pub trait Backend: Send {
    /// Create the physical index on first use
    fn setup(&mut self) -> Result<()>;

    /// Entered when the store region is first acquired
    fn standby(&mut self) -> Result<()>;

    /// Left when the store region is finally released
    fn relax(&mut self) -> Result<()>;

    fn open(&mut self, mode: OpenMode) -> Result<()>;
    fn close(&mut self) -> Result<()>;

    fn register(&mut self, mail: &MailData) -> Result<DocId>;
    fn get_flags(&mut self, uid: Uid) -> Result<String>;
    fn set_flags(&mut self, uid: Uid, flags: &str) -> Result<()>;
    fn delete_flags(&mut self, uid: Uid) -> Result<()>;
    fn delete(&mut self, uid: Uid) -> Result<()>;

    /// Execute a query and return matching uids
    fn uid_search(&mut self, query: &Query) -> Result<Vec<Uid>>;

    /// Atomically replace the whole index. The live index is renamed to a
    /// `.old` sibling and kept as a read-only shadow while `replay`
    /// re-registers every stored document; on success the shadow is
    /// deleted, on failure it is left on disk for manual recovery.
    fn rebuild(
        &mut self,
        mode: OpenMode,
        replay: &mut dyn FnMut(&mut dyn Backend) -> Result<()>,
    ) -> Result<()>;

    /// Flags from the pre-rebuild shadow; only valid mid-rebuild
    fn get_old_flags(&mut self, uid: Uid) -> Result<String>;
}

/// One indexed message inside an index file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedDocument {
    pub doc_id: DocId,
    pub uid: Uid,
    pub text: String,
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexState {
    next_doc_id: u64,
    docs: Vec<IndexedDocument>,
}

/// The physically open index: a directory holding one bincode document
/// table. Writes are buffered and flushed on save/close.
pub struct IndexFile {
    path: std::path::PathBuf,
    mode: OpenMode,
    state: IndexState,
    dirty: bool,
}

impl IndexFile {
    pub fn create(path: &Path) -> Result<()> {
        fs::create_dir_all(path)?;
        let data = bincode::serialize(&IndexState::default())?;
        fs::write(path.join("docs.bin"), data)?;
        Ok(())
    }

    pub fn open(path: &Path, mode: OpenMode) -> Result<Self> {
        let data = fs::read(path.join("docs.bin"))?;
        let state = bincode::deserialize(&data)?;
        Ok(IndexFile {
            path: path.to_path_buf(),
            mode,
            state,
            dirty: false,
        })
    }

    pub fn save(&mut self) -> Result<()> {
        if self.mode == OpenMode::ReadOnly {
            return Err(Error::new(
                ErrorKind::InvalidState,
                "index is open read-only",
            ));
        }
        let data = bincode::serialize(&self.state)?;
        fs::write(self.path.join("docs.bin"), data)?;
        self.dirty = false;
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        if self.dirty && self.mode == OpenMode::ReadWrite {
            self.save()?;
        }
        Ok(())
    }

    pub fn register(
        &mut self,
        uid: Uid,
        text: &str,
        attributes: BTreeMap<String, String>,
    ) -> DocId {
        let doc_id = DocId(self.state.next_doc_id);
        self.state.next_doc_id += 1;
        self.state.docs.push(IndexedDocument {
            doc_id,
            uid,
            text: text.to_string(),
            attributes,
        });
        self.dirty = true;
        doc_id
    }

    pub fn delete(&mut self, uid: Uid) -> Result<()> {
        let before = self.state.docs.len();
        self.state.docs.retain(|d| d.uid != uid);
        if self.state.docs.len() == before {
            return Err(Error::new(
                ErrorKind::NotFound,
                format!("no document with uid {}", uid),
            ));
        }
        self.dirty = true;
        Ok(())
    }

    pub fn docs(&self) -> &[IndexedDocument] {
        &self.state.docs
    }

    pub fn doc_by_uid(&self, uid: Uid) -> Result<&IndexedDocument> {
        self.state
            .docs
            .iter()
            .find(|d| d.uid == uid)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("no document with uid {}", uid)))
    }

    pub fn doc_by_uid_mut(&mut self, uid: Uid) -> Result<&mut IndexedDocument> {
        self.dirty = true;
        self.state
            .docs
            .iter_mut()
            .find(|d| d.uid == uid)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("no document with uid {}", uid)))
    }

    pub fn uid_of(&self, doc_id: DocId) -> Result<Uid> {
        self.state
            .docs
            .iter()
            .find(|d| d.doc_id == doc_id)
            .map(|d| d.uid)
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::NotFound,
                    format!("no document with id {}", doc_id.0),
                )
            })
    }
}

/// Split a non-compilable composite on its top operator and combine the
/// per-operand results with order-preserving set algebra. The combined
/// list keeps the first operand's ordering; there is no uid re-sort on
/// this path.
pub(crate) fn decompose_query<F>(query: &Query, execute: &mut F) -> Result<Vec<DocId>>
where
    F: FnMut(&Query) -> Result<Vec<DocId>>,
{
    let Query::Composite { op, operands } = query else {
        return Err(Error::new(
            ErrorKind::Internal,
            format!("unsupported non-composite query: {}", query),
        ));
    };
    let mut iter = operands.iter();
    let first = iter
        .next()
        .ok_or_else(|| Error::new(ErrorKind::Internal, "composite query with no operands"))?;
    let mut result = execute(first)?;
    for operand in iter {
        let other = execute(operand)?;
        result = match op {
            Operator::And => intersect_ids(result, &other),
            Operator::Or => union_ids(result, &other),
            Operator::Diff => subtract_ids(result, &other),
        };
    }
    Ok(result)
}

/// Rename the live index to its `.old` sibling and open the shadow
/// read-only. A missing live index (very first build) is not an error.
pub(crate) fn rotate_to_old(index_path: &Path, old_path: &Path) -> Result<Option<IndexFile>> {
    match fs::rename(index_path, old_path) {
        Ok(()) => Ok(Some(IndexFile::open(old_path, OpenMode::ReadOnly)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Connective between two phrase fragments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PhraseOp {
    And,
    Or,
    AndNot,
}

/// Parsed free-text phrase: quoted fragments joined by flat connectives
pub(crate) fn parse_phrase(
    phrase: &str,
    and: &str,
    or: &str,
    andnot: &str,
) -> Result<Vec<(PhraseOp, String)>> {
    let mut items = Vec::new();
    let chars: Vec<char> = phrase.chars().collect();
    let mut i = 0;
    let mut op = PhraseOp::And;
    while i < chars.len() {
        if chars[i].is_whitespace() {
            i += 1;
            continue;
        }
        if chars[i] == '"' {
            let mut term = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    Some('"') => {
                        i += 1;
                        break;
                    }
                    Some('\\') => {
                        if let Some(&c) = chars.get(i + 1) {
                            term.push(c);
                            i += 2;
                        } else {
                            return Err(bad_phrase(phrase));
                        }
                    }
                    Some(&c) => {
                        term.push(c);
                        i += 1;
                    }
                    None => return Err(bad_phrase(phrase)),
                }
            }
            items.push((op, term));
        } else {
            let start = i;
            while i < chars.len() && !chars[i].is_whitespace() {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            // ANDNOT must win over AND when the spellings share a prefix
            op = if word == andnot {
                PhraseOp::AndNot
            } else if word == and {
                PhraseOp::And
            } else if word == or {
                PhraseOp::Or
            } else {
                return Err(bad_phrase(phrase));
            };
        }
    }
    Ok(items)
}

fn bad_phrase(phrase: &str) -> Error {
    Error::new(
        ErrorKind::Internal,
        format!("malformed compiled phrase: {:?}", phrase),
    )
}

/// Left-to-right evaluation of a parsed phrase against document text
pub(crate) fn phrase_matches(text: &str, items: &[(PhraseOp, String)]) -> bool {
    let haystack = text.to_lowercase();
    let mut result = true;
    for (i, (op, term)) in items.iter().enumerate() {
        let hit = haystack.contains(&term.to_lowercase());
        if i == 0 {
            result = hit;
            continue;
        }
        result = match op {
            PhraseOp::And => result && hit,
            PhraseOp::Or => result || hit,
            PhraseOp::AndNot => result && !hit,
        };
    }
    result
}

/// Numeric comparison when both sides parse, string comparison otherwise
/// (ISO dates order correctly as strings)
pub(crate) fn compare_values(left: &str, right: &str) -> std::cmp::Ordering {
    match (left.parse::<i64>(), right.parse::<i64>()) {
        (Ok(l), Ok(r)) => l.cmp(&r),
        _ => left.cmp(right),
    }
}

// Order-preserving set algebra over result id lists: the receiving list's
// order survives, mirroring how the decomposition fallback combines
// backend results without re-sorting.

pub(crate) fn intersect_ids<T: Eq + Hash + Copy>(a: Vec<T>, b: &[T]) -> Vec<T> {
    let keep: HashSet<T> = b.iter().copied().collect();
    a.into_iter().filter(|id| keep.contains(id)).collect()
}

pub(crate) fn union_ids<T: Eq + Hash + Copy>(mut a: Vec<T>, b: &[T]) -> Vec<T> {
    let seen: HashSet<T> = a.iter().copied().collect();
    for id in b {
        if !seen.contains(id) {
            a.push(*id);
        }
    }
    a
}

pub(crate) fn subtract_ids<T: Eq + Hash + Copy>(a: Vec<T>, b: &[T]) -> Vec<T> {
    let drop: HashSet<T> = b.iter().copied().collect();
    a.into_iter().filter(|id| !drop.contains(id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_index_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index");
        IndexFile::create(&path).unwrap();

        let mut index = IndexFile::open(&path, OpenMode::ReadWrite).unwrap();
        let id = index.register(1, "hello world", BTreeMap::new());
        assert_eq!(id, DocId(0));
        index.close().unwrap();

        let index = IndexFile::open(&path, OpenMode::ReadOnly).unwrap();
        assert_eq!(index.docs().len(), 1);
        assert_eq!(index.doc_by_uid(1).unwrap().text, "hello world");
        assert_eq!(index.uid_of(DocId(0)).unwrap(), 1);
    }

    #[test]
    fn test_read_only_index_rejects_save() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index");
        IndexFile::create(&path).unwrap();
        let mut index = IndexFile::open(&path, OpenMode::ReadOnly).unwrap();
        assert!(index.save().is_err());
    }

    #[test]
    fn test_parse_phrase_connectives() {
        let items = parse_phrase(r#""a" AND "b" ANDNOT "c""#, "AND", "OR", "ANDNOT").unwrap();
        assert_eq!(
            items,
            vec![
                (PhraseOp::And, "a".to_string()),
                (PhraseOp::And, "b".to_string()),
                (PhraseOp::AndNot, "c".to_string()),
            ]
        );
    }

    #[test]
    fn test_phrase_matches_left_to_right() {
        let items = parse_phrase(r#""a" OR "b" AND "c""#, "AND", "OR", "ANDNOT").unwrap();
        // (a OR b) AND c, not a OR (b AND c)
        assert!(phrase_matches("a c", &items));
        assert!(!phrase_matches("a", &items));
        assert!(phrase_matches("b c", &items));
    }

    #[test]
    fn test_compare_values_numeric_and_string() {
        use std::cmp::Ordering;
        assert_eq!(compare_values("9", "10"), Ordering::Less);
        assert_eq!(
            compare_values("2005-08-24", "2005-08-25"),
            Ordering::Less
        );
    }

    #[test]
    fn test_id_algebra_preserves_receiver_order() {
        let a = vec![3u64, 1, 2];
        assert_eq!(intersect_ids(a.clone(), &[2, 3]), vec![3, 2]);
        assert_eq!(union_ids(a.clone(), &[5, 1]), vec![3, 1, 2, 5]);
        assert_eq!(subtract_ids(a, &[1]), vec![3, 2]);
    }
}
