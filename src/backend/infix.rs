//! Infix-condition backend. Compiled conditions use the compact infix
//! connectives `&`/`|`/`-` between quoted phrase fragments and attribute
//! lines of the form `name [!]op "value"`. Flags are kept out of the
//! index in a separate flags database that is only open between standby
//! and relax.

use std::collections::BTreeMap;
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
pub struct InfixCondition {
    pub phrase: String,
    pub attrs: Vec<String>,
    pub order_by_uid: bool,
}

pub struct InfixBackend {
    index_path: PathBuf,
    old_index_path: PathBuf,
    flags_db_path: PathBuf,
    index: Option<IndexFile>,
    old_index: Option<IndexFile>,
    flags: Option<BTreeMap<Uid, String>>,
    flags_dirty: bool,
}

impl InfixBackend {
    pub fn new(layout: &StorageLayout) -> Self {
        InfixBackend {
            index_path: layout.index_path(),
            old_index_path: layout.old_index_path(),
            flags_db_path: layout.flags_db_path(),
            index: None,
            old_index: None,
            flags: None,
            flags_dirty: false,
        }
    }

    pub fn compile(query: &Query) -> CompileResult<InfixCondition> {
        let mut cond = InfixCondition::default();
        cond.phrase = compile_node(query, &mut cond, false)?;
        Ok(cond)
    }

    pub fn search(&self, cond: &InfixCondition) -> Result<Vec<DocId>> {
        let index = self.index()?;
        let phrase = parse_phrase(&cond.phrase, "&", "|", "-")?;
        let mut hits: Vec<&IndexedDocument> = Vec::new();
        for doc in index.docs() {
            if !phrase.is_empty() && !phrase_matches(&doc.text, &phrase) {
                continue;
            }
            if cond
                .attrs
                .iter()
                .map(|line| self.attr_matches(doc, line))
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

    /// Evaluate one `name [!]op "value"` line against a document. Lines
    /// naming `flags` read the flags database instead of the document.
    fn attr_matches(&self, doc: &IndexedDocument, line: &str) -> Result<bool> {
        let (name, invert, op, value) = parse_attr_line(line)?;
        let flags_value;
        let attr_value = if name == "flags" {
            flags_value = self.flags()?.get(&doc.uid).cloned().unwrap_or_default();
            flags_value.as_str()
        } else {
            doc.attributes.get(name).map(String::as_str).unwrap_or("")
        };
        let ordering = compare_values(attr_value, &value);
        let hit = match op {
            ":" => attr_value.contains(&value),
            "=" => attr_value == value,
            "==" => ordering == std::cmp::Ordering::Equal,
            "<" => ordering == std::cmp::Ordering::Less,
            ">" => ordering == std::cmp::Ordering::Greater,
            "<=" => ordering != std::cmp::Ordering::Greater,
            ">=" => ordering != std::cmp::Ordering::Less,
            _ => {
                return Err(Error::new(
                    ErrorKind::Internal,
                    format!("unknown attribute operator: {:?}", op),
                ))
            }
        };
        Ok(hit != invert)
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

    fn flags(&self) -> Result<&BTreeMap<Uid, String>> {
        self.flags
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::InvalidState, "flags database is not open"))
    }

    fn flags_mut(&mut self) -> Result<&mut BTreeMap<Uid, String>> {
        self.flags
            .as_mut()
            .ok_or_else(|| Error::new(ErrorKind::InvalidState, "flags database is not open"))
    }

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

impl Backend for InfixBackend {
    fn setup(&mut self) -> Result<()> {
        if !self.index_path.exists() {
            IndexFile::create(&self.index_path)?;
        }
        Ok(())
    }

    fn standby(&mut self) -> Result<()> {
        let flags = match fs::read(&self.flags_db_path) {
            Ok(data) => bincode::deserialize(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        self.flags = Some(flags);
        self.flags_dirty = false;
        Ok(())
    }

    fn relax(&mut self) -> Result<()> {
        let flags = self
            .flags
            .take()
            .ok_or_else(|| Error::new(ErrorKind::InvalidState, "flags database is not open"))?;
        if self.flags_dirty {
            let data = bincode::serialize(&flags)?;
            fs::write(&self.flags_db_path, data)?;
            self.flags_dirty = false;
        }
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
        let encoded = encode_flags(&mail.flags);
        self.flags_mut()?.insert(mail.uid, encoded);
        self.flags_dirty = true;
        let uid = mail.uid;
        let text = mail.text.clone();
        Ok(self.index_mut()?.register(uid, &text, attributes))
    }

    fn get_flags(&mut self, uid: Uid) -> Result<String> {
        let encoded = self.flags()?.get(&uid).cloned().unwrap_or_default();
        Ok(decode_flags(&encoded))
    }

    fn set_flags(&mut self, uid: Uid, flags: &str) -> Result<()> {
        self.flags_mut()?.insert(uid, encode_flags(flags));
        self.flags_dirty = true;
        Ok(())
    }

    fn delete_flags(&mut self, uid: Uid) -> Result<()> {
        self.set_flags(uid, "")
    }

    fn delete(&mut self, uid: Uid) -> Result<()> {
        self.index_mut()?.delete(uid)?;
        if self.flags_mut()?.remove(&uid).is_some() {
            self.flags_dirty = true;
        }
        Ok(())
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
        self.old_index = None;
        result
    }

    /// The flags database outlives the index, so the shadow only serves
    /// as a liveness check: pre-rebuild flags are read from the database
    /// for uids the shadow knows about.
    fn get_old_flags(&mut self, uid: Uid) -> Result<String> {
        let old = self
            .old_index
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::InvalidState, "old index is not given"))?;
        old.doc_by_uid(uid)?;
        let encoded = self.flags()?.get(&uid).cloned().unwrap_or_default();
        Ok(decode_flags(&encoded))
    }
}

fn compile_node(query: &Query, cond: &mut InfixCondition, invert: bool) -> CompileResult<String> {
    match query {
        Query::Null => Ok(String::new()),
        Query::Term(value) => Ok(quote(value)),
        Query::Property { name, value, cmp } => {
            let op = match cmp {
                Comparison::ApproxIncludes => ":",
                Comparison::Equal => {
                    if is_numeric_or_date(name) {
                        "=="
                    } else {
                        "="
                    }
                }
                ordering => {
                    if !is_numeric_or_date(name) {
                        return Err(CompileError::Invalid(Error::new(
                            ErrorKind::InvalidQuery,
                            format!("{} is not a numeric property", name),
                        )));
                    }
                    ordering.symbol()
                }
            };
            cond.attrs
                .push(format!("{} {}{} {}", name, bang(invert), op, quote(value)));
            Ok(String::new())
        }
        Query::Flag(flag) => {
            cond.attrs.push(flag_line(flag, invert));
            Ok(String::new())
        }
        Query::NoFlag(flag) => {
            cond.attrs.push(flag_line(flag, !invert));
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
                join_operands(" & ", operands, cond, invert)
            }
            Operator::Or => {
                if !operands.iter().all(|o| matches!(o, Query::Term(_))) {
                    return Err(CompileError::Unsupported("OR operands must be terms"));
                }
                join_operands(" | ", operands, cond, invert)
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
                    return Err(CompileError::Unsupported("DIFF minuend must carry text"));
                }
                let tail = join_operands(" - ", rest, cond, !invert)?;
                if tail.is_empty() {
                    Ok(head)
                } else {
                    Ok(format!("{} - {}", head, tail))
                }
            }
        },
    }
}

fn join_operands(
    joiner: &str,
    operands: &[Query],
    cond: &mut InfixCondition,
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

fn flag_line(flag: &str, invert: bool) -> String {
    format!("flags {}: {}", bang(invert), quote(&format!("<{}>", flag)))
}

fn bang(invert: bool) -> &'static str {
    if invert {
        "!"
    } else {
        ""
    }
}

fn parse_attr_line(line: &str) -> Result<(&str, bool, &str, String)> {
    let malformed = || {
        Error::new(
            ErrorKind::Internal,
            format!("malformed attribute condition: {:?}", line),
        )
    };
    let (name, rest) = line.split_once(' ').ok_or_else(malformed)?;
    let (mut op, quoted) = rest.split_once(' ').ok_or_else(malformed)?;
    let invert = op.starts_with('!');
    if invert {
        op = &op[1..];
    }
    let value = unquote(quoted).ok_or_else(malformed)?;
    Ok((name, invert, op, value))
}

fn unquote(quoted: &str) -> Option<String> {
    let inner = quoted.strip_prefix('"')?.strip_suffix('"')?;
    let mut value = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            value.push(chars.next()?);
        } else {
            value.push(c);
        }
    }
    Some(value)
}
