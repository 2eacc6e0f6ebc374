//! Attribute-condition backend. Compiled conditions carry one free-text
//! phrase whose fragments are joined by `AND`/`OR`/`ANDNOT`, plus a
//! conjunctive list of attribute lines of the form `name [!]OP value`.

use std::fs;
use std::path::PathBuf;

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{decode_flags, encode_flags, DocId, MailData, Uid};
use crate::query::ast::quote;
use crate::query::schema::is_numeric_or_date;
use crate::query::{Comparison, Operator, Query};
use crate::storage::StorageLayout;

use super::{
    compare_values, parse_phrase, phrase_matches, rotate_to_old, Backend, CompileError,
    CompileResult, IndexFile, IndexedDocument, OpenMode,
};

/// Compiled form of a query tree for this backend
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AttrCondition {
    pub phrase: String,
    pub attrs: Vec<String>,
    pub order_by_uid: bool,
}

pub struct AttrBackend {
    index_path: PathBuf,
    old_index_path: PathBuf,
    index: Option<IndexFile>,
    old_index: Option<IndexFile>,
}

impl AttrBackend {
    pub fn new(layout: &StorageLayout) -> Self {
        AttrBackend {
            index_path: layout.index_path(),
            old_index_path: layout.old_index_path(),
            index: None,
            old_index: None,
        }
    }

    /// Turn a query tree into a single condition, or signal why it cannot
    /// be expressed as one
    pub fn compile(query: &Query) -> CompileResult<AttrCondition> {
        let mut cond = AttrCondition::default();
        cond.phrase = compile_node(query, &mut cond, false)?;
        Ok(cond)
    }

    /// Evaluate a compiled condition against the open index
    pub fn search(&self, cond: &AttrCondition) -> Result<Vec<DocId>> {
        let index = self.index()?;
        let phrase = parse_phrase(&cond.phrase, "AND", "OR", "ANDNOT")?;
        let mut hits: Vec<&IndexedDocument> = Vec::new();
        for doc in index.docs() {
            if !phrase.is_empty() && !phrase_matches(&doc.text, &phrase) {
                continue;
            }
            if cond
                .attrs
                .iter()
                .map(|line| attr_matches(doc, line))
                .collect::<Result<Vec<bool>>>()?
                .into_iter()
                .all(|hit| hit)
            {
                hits.push(doc);
            }
        }
        if cond.order_by_uid {
            hits.sort_by_key(|d| d.uid);
        }
        Ok(hits.iter().map(|d| d.doc_id).collect())
    }

    /// Compile-or-decompose executor. Trees the condition grammar cannot
    /// express are split on their top operator and the operand results
    /// combined with order-preserving set algebra; the combined list keeps
    /// the first operand's ordering and is not re-sorted.
    fn execute(&self, query: &Query) -> Result<Vec<DocId>> {
        match Self::compile(query) {
            Ok(mut cond) => {
                cond.order_by_uid = true;
                self.search(&cond)
            }
            Err(CompileError::Invalid(e)) => Err(e),
            Err(CompileError::Unsupported(reason)) => {
                log::debug!("decomposing query ({}): {}", reason, query);
                super::decompose_query(query, &mut |q| self.execute(q))
            }
        }
    }

    fn index(&self) -> Result<&IndexFile> {
        self.index
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::InvalidState, "index is not open"))
    }

    fn index_mut(&mut self) -> Result<&mut IndexFile> {
        self.index
            .as_mut()
            .ok_or_else(|| Error::new(ErrorKind::InvalidState, "index is not open"))
    }

    /// Create and populate the replacement index. The fresh index keeps
    /// whatever was registered before a failure, so a partial rebuild is
    /// inspectable on disk.
    fn replay_into_fresh_index(
        &mut self,
        mode: OpenMode,
        replay: &mut dyn FnMut(&mut dyn Backend) -> Result<()>,
    ) -> Result<()> {
        IndexFile::create(&self.index_path)?;
        self.index = Some(IndexFile::open(&self.index_path, mode)?);
        let replayed = replay(self);
        if let Some(index) = self.index.take() {
            index.close()?;
        }
        replayed
    }
}

impl Backend for AttrBackend {
    fn setup(&mut self) -> Result<()> {
        if !self.index_path.exists() {
            IndexFile::create(&self.index_path)?;
        }
        Ok(())
    }

    fn standby(&mut self) -> Result<()> {
        Ok(())
    }

    fn relax(&mut self) -> Result<()> {
        Ok(())
    }

    fn open(&mut self, mode: OpenMode) -> Result<()> {
        if self.index.is_some() {
            return Err(Error::new(ErrorKind::InvalidState, "index is already open"));
        }
        self.index = Some(IndexFile::open(&self.index_path, mode)?);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        match self.index.take() {
            Some(index) => index.close(),
            None => Err(Error::new(ErrorKind::InvalidState, "index is not open")),
        }
    }

    fn register(&mut self, mail: &MailData) -> Result<DocId> {
        let mut attributes = mail.attributes.clone();
        attributes.insert("uid".to_string(), mail.uid.to_string());
        attributes.insert("flags".to_string(), encode_flags(&mail.flags));
        let uid = mail.uid;
        let text = mail.text.clone();
        Ok(self.index_mut()?.register(uid, &text, attributes))
    }

    fn get_flags(&mut self, uid: Uid) -> Result<String> {
        let doc = self.index()?.doc_by_uid(uid)?;
        let encoded = doc.attributes.get("flags").map(String::as_str).unwrap_or("");
        Ok(decode_flags(encoded))
    }

    fn set_flags(&mut self, uid: Uid, flags: &str) -> Result<()> {
        let doc = self.index_mut()?.doc_by_uid_mut(uid)?;
        doc.attributes
            .insert("flags".to_string(), encode_flags(flags));
        Ok(())
    }

    fn delete_flags(&mut self, uid: Uid) -> Result<()> {
        self.set_flags(uid, "")
    }

    fn delete(&mut self, uid: Uid) -> Result<()> {
        self.index_mut()?.delete(uid)
    }

    fn uid_search(&mut self, query: &Query) -> Result<Vec<Uid>> {
        let doc_ids = self.execute(query)?;
        let index = self.index()?;
        doc_ids.iter().map(|&id| index.uid_of(id)).collect()
    }

    fn rebuild(
        &mut self,
        mode: OpenMode,
        replay: &mut dyn FnMut(&mut dyn Backend) -> Result<()>,
    ) -> Result<()> {
        self.old_index = rotate_to_old(&self.index_path, &self.old_index_path)?;
        let result = self.replay_into_fresh_index(mode, replay).and_then(|_| {
            match self.old_index {
                Some(_) => fs::remove_dir_all(&self.old_index_path).map_err(Error::from),
                None => Ok(()),
            }
        });
        // The shadow handle is released on every exit path; on failure the
        // old directory itself stays on disk for manual recovery.
        self.old_index = None;
        result
    }

    fn get_old_flags(&mut self, uid: Uid) -> Result<String> {
        let old = self
            .old_index
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::InvalidState, "old index is not given"))?;
        let doc = old.doc_by_uid(uid)?;
        let encoded = doc.attributes.get("flags").map(String::as_str).unwrap_or("");
        Ok(decode_flags(encoded))
    }
}

fn compile_node(query: &Query, cond: &mut AttrCondition, invert: bool) -> CompileResult<String> {
    match query {
        Query::Null => Ok(String::new()),
        Query::Term(value) => Ok(quote(value)),
        Query::Property { name, value, cmp } => {
            let op = match cmp {
                Comparison::ApproxIncludes => "STRINC",
                Comparison::Equal => {
                    if is_numeric_or_date(name) {
                        "NUMEQ"
                    } else {
                        "STREQ"
                    }
                }
                ordering => {
                    if !is_numeric_or_date(name) {
                        return Err(CompileError::Invalid(Error::new(
                            ErrorKind::InvalidQuery,
                            format!("{} is not a numeric property", name),
                        )));
                    }
                    match ordering {
                        Comparison::LessThan => "NUMLT",
                        Comparison::GreaterThan => "NUMGT",
                        Comparison::LessOrEqual => "NUMLE",
                        Comparison::GreaterOrEqual => "NUMGE",
                        _ => unreachable!(),
                    }
                }
            };
            cond.attrs
                .push(format!("{} {}{} {}", name, bang(invert), op, value));
            Ok(String::new())
        }
        Query::Flag(flag) => {
            cond.attrs
                .push(format!("flags {}STRINC <{}>", bang(invert), flag));
            Ok(String::new())
        }
        Query::NoFlag(flag) => {
            cond.attrs
                .push(format!("flags {}STRINC <{}>", bang(!invert), flag));
            Ok(String::new())
        }
        Query::Composite { op, operands } => match op {
            Operator::And => {
                let legal = operands
                    .iter()
                    .all(|o| !o.is_composite() || matches!(o, Query::Composite { op: Operator::And, .. }));
                if !legal {
                    return Err(CompileError::Unsupported(
                        "AND operands must be non-composite or AND",
                    ));
                }
                join_operands(" AND ", operands, cond, invert)
            }
            Operator::Or => {
                if !operands.iter().all(|o| matches!(o, Query::Term(_))) {
                    return Err(CompileError::Unsupported("OR operands must be terms"));
                }
                join_operands(" OR ", operands, cond, invert)
            }
            Operator::Diff => {
                let Some((first, rest)) = operands.split_first() else {
                    return Err(CompileError::Invalid(Error::new(
                        ErrorKind::Internal,
                        "composite query with no operands",
                    )));
                };
                if rest.iter().any(Query::is_composite) {
                    return Err(CompileError::Unsupported(
                        "DIFF subtrahends must be non-composite",
                    ));
                }
                let head = compile_node(first, cond, invert)?;
                if head.is_empty() {
                    return Err(CompileError::Unsupported(
                        "DIFF minuend must carry text",
                    ));
                }
                let tail = join_operands(" ANDNOT ", rest, cond, !invert)?;
                if tail.is_empty() {
                    Ok(head)
                } else {
                    Ok(format!("{} ANDNOT {}", head, tail))
                }
            }
        },
    }
}

fn join_operands(
    joiner: &str,
    operands: &[Query],
    cond: &mut AttrCondition,
    invert: bool,
) -> CompileResult<String> {
    let mut fragments = Vec::new();
    for operand in operands {
        let fragment = compile_node(operand, cond, invert)?;
        if !fragment.is_empty() {
            fragments.push(fragment);
        }
    }
    Ok(fragments.join(joiner))
}

fn bang(invert: bool) -> &'static str {
    if invert {
        "!"
    } else {
        ""
    }
}

/// Evaluate one `name [!]OP value` line against a document
fn attr_matches(doc: &IndexedDocument, line: &str) -> Result<bool> {
    let mut parts = line.splitn(3, ' ');
    let (Some(name), Some(mut op), Some(value)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::new(
            ErrorKind::Internal,
            format!("malformed attribute condition: {:?}", line),
        ));
    };
    let invert = op.starts_with('!');
    if invert {
        op = &op[1..];
    }
    let attr_value = doc.attributes.get(name).map(String::as_str).unwrap_or("");
    let ordering = compare_values(attr_value, value);
    let hit = match op {
        "STRINC" => attr_value.contains(value),
        "STREQ" => attr_value == value,
        "NUMEQ" => ordering == std::cmp::Ordering::Equal,
        "NUMLT" => ordering == std::cmp::Ordering::Less,
        "NUMGT" => ordering == std::cmp::Ordering::Greater,
        "NUMLE" => ordering != std::cmp::Ordering::Greater,
        "NUMGE" => ordering != std::cmp::Ordering::Less,
        _ => {
            return Err(Error::new(
                ErrorKind::Internal,
                format!("unknown attribute operator: {:?}", op),
            ))
        }
    };
    Ok(hit != invert)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn backend(dir: &std::path::Path) -> AttrBackend {
        let layout = StorageLayout::new(dir).unwrap();
        let mut backend = AttrBackend::new(&layout);
        backend.setup().unwrap();
        backend
    }

    fn mail(uid: Uid, text: &str, subject: &str) -> MailData {
        MailData::new(uid, text).with_attribute("subject", subject)
    }

    #[test]
    fn test_compile_term_and_property() {
        let query = Query::parse("hello subject : foo").unwrap();
        let cond = AttrBackend::compile(&query).unwrap();
        assert_eq!(cond.phrase, "\"hello\"");
        assert_eq!(cond.attrs, vec!["subject STRINC foo"]);
    }

    #[test]
    fn test_compile_numeric_comparisons() {
        let cond = AttrBackend::compile(&Query::parse("uid >= 10 & size < 100").unwrap()).unwrap();
        assert_eq!(cond.phrase, "");
        assert_eq!(cond.attrs, vec!["uid NUMGE 10", "size NUMLT 100"]);
    }

    #[test]
    fn test_compile_equal_picks_numeric_or_string_operator() {
        let cond = AttrBackend::compile(&Query::parse("uid = 3").unwrap()).unwrap();
        assert_eq!(cond.attrs, vec!["uid NUMEQ 3"]);
        let cond = AttrBackend::compile(&Query::parse("subject = foo").unwrap()).unwrap();
        assert_eq!(cond.attrs, vec!["subject STREQ foo"]);
    }

    #[test]
    fn test_compile_rejects_ordering_on_string_property() {
        let err = AttrBackend::compile(&Query::parse("subject < foo").unwrap());
        assert!(matches!(err, Err(CompileError::Invalid(ref e))
            if e.kind == ErrorKind::InvalidQuery));
        // flags is string-typed despite its bracket encoding
        let err = AttrBackend::compile(&Query::parse(r"flags < \Seen").unwrap());
        assert!(matches!(err, Err(CompileError::Invalid(ref e))
            if e.kind == ErrorKind::InvalidQuery));
    }

    #[test]
    fn test_compile_flag_and_noflag() {
        let cond = AttrBackend::compile(&Query::parse(r"flag : \Seen").unwrap()).unwrap();
        assert_eq!(cond.attrs, vec![r"flags STRINC <\Seen>"]);
        let cond = AttrBackend::compile(&Query::parse(r"noflag : \Seen").unwrap()).unwrap();
        assert_eq!(cond.attrs, vec![r"flags !STRINC <\Seen>"]);
    }

    #[test]
    fn test_compile_diff_inverts_subtracted_flags() {
        let cond = AttrBackend::compile(&Query::parse(r"hello - flag : \Seen").unwrap()).unwrap();
        assert_eq!(cond.phrase, "\"hello\"");
        assert_eq!(cond.attrs, vec![r"flags !STRINC <\Seen>"]);
    }

    #[test]
    fn test_compile_or_of_non_terms_is_unsupported() {
        let query = Query::parse("subject : foo | subject : bar").unwrap();
        assert!(matches!(
            AttrBackend::compile(&query),
            Err(CompileError::Unsupported(_))
        ));
    }

    #[test]
    fn test_compile_diff_without_text_minuend_is_unsupported() {
        let query = Query::parse("uid > 2 - hello").unwrap();
        assert!(matches!(
            AttrBackend::compile(&query),
            Err(CompileError::Unsupported(_))
        ));
    }

    #[test]
    fn test_search_phrase_and_attrs() {
        let dir = tempdir().unwrap();
        let mut b = backend(dir.path());
        b.open(OpenMode::ReadWrite).unwrap();
        b.register(&mail(1, "hello world", "greeting")).unwrap();
        b.register(&mail(2, "goodbye world", "farewell")).unwrap();

        let uids = b
            .uid_search(&Query::parse("world subject : farewell").unwrap())
            .unwrap();
        assert_eq!(uids, vec![2]);
        b.close().unwrap();
    }

    #[test]
    fn test_decomposed_query_matches_direct_equivalent() {
        let dir = tempdir().unwrap();
        let mut b = backend(dir.path());
        b.open(OpenMode::ReadWrite).unwrap();
        b.register(&mail(1, "alpha beta", "x")).unwrap();
        b.register(&mail(2, "alpha", "x")).unwrap();
        b.register(&mail(3, "beta", "x")).unwrap();

        let direct = b.uid_search(&Query::parse("alpha beta").unwrap()).unwrap();
        // same result set, but the top OR only compiles via decomposition
        let decomposed = b
            .uid_search(&Query::parse("(alpha beta) | (beta alpha)").unwrap())
            .unwrap();
        assert_eq!(direct, vec![1]);
        assert_eq!(decomposed, direct);
        b.close().unwrap();
    }

    #[test]
    fn test_fallback_keeps_operand_order_not_uid_order() {
        let dir = tempdir().unwrap();
        let mut b = backend(dir.path());
        b.open(OpenMode::ReadWrite).unwrap();
        b.register(&mail(1, "bravo", "x")).unwrap();
        b.register(&mail(2, "alpha", "x")).unwrap();

        // each operand is a property query, so the OR decomposes; the
        // union keeps the first operand's hits before the second's and
        // skips the uid re-sort a directly compiled query gets
        let uids = b
            .uid_search(&Query::parse("uid = 2 | uid = 1").unwrap())
            .unwrap();
        assert_eq!(uids, vec![2, 1]);
        b.close().unwrap();
    }

    #[test]
    fn test_flags_survive_round_trip() {
        let dir = tempdir().unwrap();
        let mut b = backend(dir.path());
        b.open(OpenMode::ReadWrite).unwrap();
        b.register(&mail(1, "hello", "x")).unwrap();
        assert_eq!(b.get_flags(1).unwrap(), "");
        b.set_flags(1, r"\Seen \Answered").unwrap();
        assert_eq!(b.get_flags(1).unwrap(), r"\Seen \Answered");
        b.delete_flags(1).unwrap();
        assert_eq!(b.get_flags(1).unwrap(), "");
        b.close().unwrap();
    }

    #[test]
    fn test_flag_search_does_not_cross_match() {
        let dir = tempdir().unwrap();
        let mut b = backend(dir.path());
        b.open(OpenMode::ReadWrite).unwrap();
        b.register(&mail(1, "hello", "x")).unwrap();
        b.register(&mail(2, "hello", "x")).unwrap();
        b.set_flags(1, r"\Seen").unwrap();

        let seen = b.uid_search(&Query::parse(r"flag : \Seen").unwrap()).unwrap();
        assert_eq!(seen, vec![1]);
        let unseen = b
            .uid_search(&Query::parse(r"noflag : \Seen").unwrap())
            .unwrap();
        assert_eq!(unseen, vec![2]);
        b.close().unwrap();
    }

    #[test]
    fn test_rebuild_preserves_flags_and_removes_shadow() {
        let dir = tempdir().unwrap();
        let mut b = backend(dir.path());
        b.open(OpenMode::ReadWrite).unwrap();
        b.register(&mail(1, "hello", "x")).unwrap();
        b.set_flags(1, r"\Seen").unwrap();
        b.close().unwrap();

        b.rebuild(OpenMode::ReadWrite, &mut |backend| {
            let flags = backend.get_old_flags(1)?;
            backend.register(&mail(1, "hello", "x").with_flags(flags))?;
            Ok(())
        })
        .unwrap();

        assert!(!dir.path().join("index.old").exists());
        b.open(OpenMode::ReadOnly).unwrap();
        assert_eq!(b.get_flags(1).unwrap(), r"\Seen");
        b.close().unwrap();
    }

    #[test]
    fn test_failed_rebuild_keeps_shadow_on_disk() {
        let dir = tempdir().unwrap();
        let mut b = backend(dir.path());
        b.open(OpenMode::ReadWrite).unwrap();
        b.register(&mail(1, "hello", "x")).unwrap();
        b.close().unwrap();

        let err = b.rebuild(OpenMode::ReadWrite, &mut |_| {
            Err(Error::new(ErrorKind::Internal, "boom"))
        });
        assert!(err.is_err());
        assert!(dir.path().join("index.old").exists());
        // the shadow handle is released on every exit path
        assert!(b.get_old_flags(1).is_err());
    }

    #[test]
    fn test_get_old_flags_outside_rebuild_is_invalid() {
        let dir = tempdir().unwrap();
        let mut b = backend(dir.path());
        let err = b.get_old_flags(1).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);
    }
}
