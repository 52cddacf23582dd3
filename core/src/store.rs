use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionResult, TransactionalTree, UnabortableTransactionError};
use sled::{Transactional, Tree};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::path::Path;

use crate::{DocId, Field, Position, TermId};

const LINK_OUT: u8 = 0;
const LINK_IN: u8 = 1;

/// One row of the document table. `size` is the body token count used for
/// length normalization; `last_modified` is unix seconds, `None` while the
/// document is only a placeholder discovered through a link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: DocId,
    pub url: String,
    pub title: Option<String>,
    pub content: Option<String>,
    pub size: u32,
    pub last_modified: Option<i64>,
}

/// One occurrence of a term, ordered by document then position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Posting {
    pub doc: DocId,
    pub pos: Position,
}

/// Everything a re-index replaces for one document: parsed metadata, the
/// analyzed token streams for both fields, and the resolved outgoing links.
#[derive(Debug, Default, Clone)]
pub struct DocumentUpdate {
    pub title: Option<String>,
    pub content: Option<String>,
    pub last_modified: i64,
    pub title_tokens: Vec<String>,
    pub body_tokens: Vec<String>,
    pub children: Vec<DocId>,
}

/// Durable index store: document table, two term dictionaries, two
/// positional postings tables, two frequency tables and the link graph,
/// all as sled trees with big-endian composite keys so that range scans
/// walk postings in (term, doc, position) order.
#[derive(Clone)]
pub struct Store {
    db: sled::Db,
    documents: Tree,
    urls: Tree,
    title_terms: Tree,
    body_terms: Tree,
    title_words: Tree,
    body_words: Tree,
    title_postings: Tree,
    body_postings: Tree,
    title_counts: Tree,
    body_counts: Tree,
    doc_fields: Tree,
    links: Tree,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Store> {
        let db = sled::open(path)?;
        Ok(Store {
            documents: db.open_tree("documents")?,
            urls: db.open_tree("urls")?,
            title_terms: db.open_tree("title_terms")?,
            body_terms: db.open_tree("body_terms")?,
            title_words: db.open_tree("title_words")?,
            body_words: db.open_tree("body_words")?,
            title_postings: db.open_tree("title_postings")?,
            body_postings: db.open_tree("body_postings")?,
            title_counts: db.open_tree("title_counts")?,
            body_counts: db.open_tree("body_counts")?,
            doc_fields: db.open_tree("doc_fields")?,
            links: db.open_tree("links")?,
            db,
        })
    }

    fn terms_tree(&self, field: Field) -> &Tree {
        match field {
            Field::Title => &self.title_terms,
            Field::Body => &self.body_terms,
        }
    }

    fn words_tree(&self, field: Field) -> &Tree {
        match field {
            Field::Title => &self.title_words,
            Field::Body => &self.body_words,
        }
    }

    fn postings_tree(&self, field: Field) -> &Tree {
        match field {
            Field::Title => &self.title_postings,
            Field::Body => &self.body_postings,
        }
    }

    fn counts_tree(&self, field: Field) -> &Tree {
        match field {
            Field::Title => &self.title_counts,
            Field::Body => &self.body_counts,
        }
    }

    /// Look up the document registered for `url`, creating an empty
    /// placeholder with a fresh id when the url has never been seen.
    pub fn resolve_or_create(&self, url: &str) -> Result<Document> {
        if let Some(raw) = self.urls.get(url.as_bytes())? {
            let id = decode_u64(&raw);
            return self
                .document(id)?
                .with_context(|| format!("url table points at missing document {id}"));
        }
        let id = self.db.generate_id()?;
        match self
            .urls
            .compare_and_swap(url.as_bytes(), None::<&[u8]>, Some(&be64(id)[..]))?
        {
            Ok(()) => {
                let doc = Document {
                    id,
                    url: url.to_string(),
                    title: None,
                    content: None,
                    size: 0,
                    last_modified: None,
                };
                self.documents.insert(be64(id), bincode::serialize(&doc)?)?;
                Ok(doc)
            }
            Err(cas) => {
                // Another writer registered the url between our read and the swap.
                let current = cas
                    .current
                    .context("url registration raced with a deletion")?;
                let id = decode_u64(&current);
                self.document(id)?
                    .with_context(|| format!("url table points at missing document {id}"))
            }
        }
    }

    pub fn document(&self, id: DocId) -> Result<Option<Document>> {
        match self.documents.get(be64(id))? {
            Some(raw) => Ok(Some(bincode::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn document_by_url(&self, url: &str) -> Result<Option<Document>> {
        match self.urls.get(url.as_bytes())? {
            Some(raw) => self.document(decode_u64(&raw)),
            None => Ok(None),
        }
    }

    /// Atomically replace everything indexed for one document: both fields'
    /// postings and frequency counts, the forward token records, the
    /// outgoing link set and the document row itself. Readers observe
    /// either the old state or the new state, never a mix.
    pub fn reindex(&self, doc_id: DocId, update: DocumentUpdate) -> Result<()> {
        let mut doc = self
            .document(doc_id)?
            .with_context(|| format!("cannot reindex unknown document {doc_id}"))?;

        let title_ids = self.intern(Field::Title, &update.title_tokens)?;
        let body_ids = self.intern(Field::Body, &update.body_tokens)?;

        // The single-writer discipline makes it safe to derive the keys to
        // delete outside the transaction.
        let old_title = self.field_tokens(Field::Title, doc_id)?;
        let old_body = self.field_tokens(Field::Body, doc_id)?;
        let old_children = self.children(doc_id)?;

        let mut new_children = update.children;
        new_children.sort_unstable();
        new_children.dedup();

        doc.title = update.title;
        doc.content = update.content;
        doc.size = body_ids.len() as u32;
        doc.last_modified = Some(update.last_modified);

        let doc_raw = bincode::serialize(&doc)?;
        let title_rec = bincode::serialize(&title_ids)?;
        let body_rec = bincode::serialize(&body_ids)?;

        (
            &self.documents,
            &self.title_postings,
            &self.title_counts,
            &self.body_postings,
            &self.body_counts,
            &self.doc_fields,
            &self.links,
        )
            .transaction(
                |(documents, title_postings, title_counts, body_postings, body_counts, doc_fields, links)| -> ConflictableTransactionResult<(), ()> {
                    replace_field(title_postings, title_counts, doc_id, &old_title, &title_ids)?;
                    replace_field(body_postings, body_counts, doc_id, &old_body, &body_ids)?;
                    doc_fields.insert(&field_key(Field::Title, doc_id)[..], title_rec.as_slice())?;
                    doc_fields.insert(&field_key(Field::Body, doc_id)[..], body_rec.as_slice())?;
                    for &child in &old_children {
                        links.remove(&link_key(LINK_OUT, doc_id, child)[..])?;
                        links.remove(&link_key(LINK_IN, child, doc_id)[..])?;
                    }
                    for &child in &new_children {
                        links.insert(&link_key(LINK_OUT, doc_id, child)[..], &[][..])?;
                        links.insert(&link_key(LINK_IN, child, doc_id)[..], &[][..])?;
                    }
                    documents.insert(&be64(doc_id)[..], doc_raw.as_slice())?;
                    Ok(())
                },
            )
            .map_err(|e| anyhow::anyhow!("reindex transaction for document {doc_id} failed: {e:?}"))?;
        Ok(())
    }

    /// Intern each token in the field's dictionary, creating ids lazily.
    /// Dictionary entries are never deleted.
    fn intern(&self, field: Field, tokens: &[String]) -> Result<Vec<TermId>> {
        let terms = self.terms_tree(field);
        let words = self.words_tree(field);
        let mut ids = Vec::with_capacity(tokens.len());
        for token in tokens {
            let id = match terms.get(token.as_bytes())? {
                Some(raw) => decode_u64(&raw),
                None => {
                    let id = self.db.generate_id()?;
                    terms.insert(token.as_bytes(), &be64(id)[..])?;
                    words.insert(be64(id), token.as_bytes())?;
                    id
                }
            };
            ids.push(id);
        }
        Ok(ids)
    }

    pub fn term_id(&self, field: Field, word: &str) -> Result<Option<TermId>> {
        Ok(self
            .terms_tree(field)
            .get(word.as_bytes())?
            .map(|raw| decode_u64(&raw)))
    }

    pub fn term_word(&self, field: Field, term: TermId) -> Result<Option<String>> {
        Ok(self
            .words_tree(field)
            .get(be64(term))?
            .map(|raw| String::from_utf8_lossy(&raw).into_owned()))
    }

    /// Smallest posting for `term` strictly greater than `after` in
    /// (doc, position) order; `None` starts from the beginning.
    pub fn next_posting(
        &self,
        field: Field,
        term: TermId,
        after: Option<Posting>,
    ) -> Result<Option<Posting>> {
        let start = match after {
            Some(p) => Bound::Excluded(posting_key(term, p.doc, p.pos).to_vec()),
            None => Bound::Included(posting_key(term, 0, 0).to_vec()),
        };
        let entry = self
            .postings_tree(field)
            .range((start, Bound::Unbounded))
            .next()
            .transpose()?;
        Ok(entry.and_then(|(key, _)| {
            let (t, posting) = decode_posting_key(&key);
            (t == term).then_some(posting)
        }))
    }

    /// Largest posting for `term` strictly less than `before`.
    pub fn prev_posting(&self, field: Field, term: TermId, before: Posting) -> Result<Option<Posting>> {
        let start = Bound::Included(posting_key(term, 0, 0).to_vec());
        let end = Bound::Excluded(posting_key(term, before.doc, before.pos).to_vec());
        let entry = self
            .postings_tree(field)
            .range((start, end))
            .next_back()
            .transpose()?;
        Ok(entry.map(|(key, _)| decode_posting_key(&key).1))
    }

    /// Materialized occurrence count for (term, doc); zero when absent.
    pub fn term_frequency(&self, field: Field, term: TermId, doc: DocId) -> Result<u32> {
        Ok(self
            .counts_tree(field)
            .get(count_key(term, doc))?
            .map(|raw| decode_u32(&raw))
            .unwrap_or(0))
    }

    /// Number of documents with at least one occurrence of `term`.
    pub fn document_frequency(&self, field: Field, term: TermId) -> Result<u64> {
        let mut n = 0;
        for entry in self.counts_tree(field).scan_prefix(be64(term)) {
            entry?;
            n += 1;
        }
        Ok(n)
    }

    /// Smallest document id strictly greater than `after` with a non-zero
    /// count for `term`; `None` starts from the beginning.
    pub fn next_doc_with_term(
        &self,
        field: Field,
        term: TermId,
        after: Option<DocId>,
    ) -> Result<Option<DocId>> {
        let start = match after {
            Some(doc) => Bound::Excluded(count_key(term, doc).to_vec()),
            None => Bound::Included(count_key(term, 0).to_vec()),
        };
        let entry = self
            .counts_tree(field)
            .range((start, Bound::Unbounded))
            .next()
            .transpose()?;
        Ok(entry.and_then(|(key, _)| {
            let (t, doc) = decode_count_key(&key);
            (t == term).then_some(doc)
        }))
    }

    /// The analyzed token stream of a field in position order, empty when
    /// the field was never indexed for this document.
    pub fn field_tokens(&self, field: Field, doc: DocId) -> Result<Vec<TermId>> {
        match self.doc_fields.get(field_key(field, doc))? {
            Some(raw) => Ok(bincode::deserialize(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn children(&self, doc: DocId) -> Result<Vec<DocId>> {
        self.link_endpoints(LINK_OUT, doc)
    }

    pub fn parents(&self, doc: DocId) -> Result<Vec<DocId>> {
        self.link_endpoints(LINK_IN, doc)
    }

    fn link_endpoints(&self, dir: u8, doc: DocId) -> Result<Vec<DocId>> {
        let mut prefix = [0u8; 9];
        prefix[0] = dir;
        prefix[1..9].copy_from_slice(&be64(doc));
        let mut out = Vec::new();
        for entry in self.links.scan_prefix(prefix) {
            let (key, _) = entry?;
            out.push(decode_u64(&key[9..17]));
        }
        Ok(out)
    }

    /// Corpus document count N (placeholders included, matching the
    /// document table).
    pub fn document_count(&self) -> Result<u64> {
        Ok(self.documents.len() as u64)
    }

    /// Average body size over the whole document table.
    pub fn average_size(&self) -> Result<f64> {
        let mut total = 0u64;
        let mut n = 0u64;
        for entry in self.documents.iter() {
            let (_, raw) = entry?;
            let doc: Document = bincode::deserialize(&raw)?;
            total += doc.size as u64;
            n += 1;
        }
        if n == 0 {
            Ok(0.0)
        } else {
            Ok(total as f64 / n as f64)
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn replace_field(
    postings: &TransactionalTree,
    counts: &TransactionalTree,
    doc: DocId,
    old: &[TermId],
    new: &[TermId],
) -> Result<(), UnabortableTransactionError> {
    for (pos, &term) in old.iter().enumerate() {
        postings.remove(&posting_key(term, doc, pos as Position)[..])?;
    }
    for &term in old.iter().collect::<BTreeSet<_>>() {
        counts.remove(&count_key(term, doc)[..])?;
    }
    for (pos, &term) in new.iter().enumerate() {
        postings.insert(&posting_key(term, doc, pos as Position)[..], &[][..])?;
    }
    let mut freq: BTreeMap<TermId, u32> = BTreeMap::new();
    for &term in new {
        *freq.entry(term).or_insert(0) += 1;
    }
    for (term, count) in freq {
        counts.insert(&count_key(term, doc)[..], &count.to_be_bytes()[..])?;
    }
    Ok(())
}

fn be64(v: u64) -> [u8; 8] {
    v.to_be_bytes()
}

fn decode_u64(raw: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&raw[..8]);
    u64::from_be_bytes(buf)
}

fn decode_u32(raw: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&raw[..4]);
    u32::from_be_bytes(buf)
}

fn posting_key(term: TermId, doc: DocId, pos: Position) -> [u8; 20] {
    let mut key = [0u8; 20];
    key[..8].copy_from_slice(&term.to_be_bytes());
    key[8..16].copy_from_slice(&doc.to_be_bytes());
    key[16..20].copy_from_slice(&pos.to_be_bytes());
    key
}

fn decode_posting_key(key: &[u8]) -> (TermId, Posting) {
    let term = decode_u64(&key[..8]);
    let doc = decode_u64(&key[8..16]);
    let pos = decode_u32(&key[16..20]);
    (term, Posting { doc, pos })
}

fn count_key(term: TermId, doc: DocId) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&term.to_be_bytes());
    key[8..16].copy_from_slice(&doc.to_be_bytes());
    key
}

fn decode_count_key(key: &[u8]) -> (TermId, DocId) {
    (decode_u64(&key[..8]), decode_u64(&key[8..16]))
}

fn field_key(field: Field, doc: DocId) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = field.byte();
    key[1..9].copy_from_slice(&doc.to_be_bytes());
    key
}

fn link_key(dir: u8, a: DocId, b: DocId) -> [u8; 17] {
    let mut key = [0u8; 17];
    key[0] = dir;
    key[1..9].copy_from_slice(&a.to_be_bytes());
    key[9..17].copy_from_slice(&b.to_be_bytes());
    key
}
