//! BM25-style ranking and the query pipeline: analyze the query into
//! phrases, drive one cursor per (phrase, field) in ascending document
//! order, accumulate per-document scores and keep the top K in a bounded
//! min-heap.

use anyhow::Result;
use serde::Serialize;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};

use crate::analyzer;
use crate::phrase::{self, FieldPhrase};
use crate::store::Store;
use crate::{DocId, Field, TermId};

/// Ranking constants. k1 saturates title term frequency, k2 body term
/// frequency; b controls length normalization against the corpus average.
#[derive(Debug, Clone, Copy)]
pub struct RankParams {
    pub k1: f64,
    pub k2: f64,
    pub b: f64,
    pub top_k: usize,
}

impl Default for RankParams {
    fn default() -> Self {
        RankParams {
            k1: 1.6,
            k2: 1.2,
            b: 0.75,
            top_k: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub doc_id: DocId,
    pub score: f64,
    pub title: Option<String>,
    pub url: String,
    pub last_modified: Option<i64>,
    pub size: u32,
    pub keywords: Vec<KeywordCount>,
    pub children: Vec<LinkSummary>,
}

/// One entry of the keyword digest: a frequent body term and its count.
#[derive(Debug, Clone, Serialize)]
pub struct KeywordCount {
    pub word: String,
    pub count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkSummary {
    pub title: Option<String>,
    pub url: String,
}

struct PhraseCursor {
    phrase: FieldPhrase,
    /// Document frequency of the phrase, constant for the whole query.
    nt: u64,
    next_doc: DocId,
}

struct Scored {
    score: f64,
    doc: DocId,
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then(self.doc.cmp(&other.doc))
    }
}

pub struct SearchEngine {
    store: Store,
    params: RankParams,
}

impl SearchEngine {
    pub fn new(store: Store) -> SearchEngine {
        SearchEngine::with_params(store, RankParams::default())
    }

    pub fn with_params(store: Store, params: RankParams) -> SearchEngine {
        SearchEngine { store, params }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn search(&self, query: &str) -> Result<Vec<SearchResult>> {
        self.search_top(query, self.params.top_k)
    }

    /// Run the full pipeline: analyze, resolve phrases per field, merge
    /// cursors in ascending document order, rank, materialize. A query
    /// with nothing to resolve returns an empty list, never an error.
    pub fn search_top(&self, query: &str, top_k: usize) -> Result<Vec<SearchResult>> {
        let phrases = analyzer::parse_query(query);
        if phrases.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let n = self.store.document_count()? as f64;
        let mut lavg = self.store.average_size()?;
        if n == 0.0 {
            return Ok(Vec::new());
        }
        if lavg <= 0.0 {
            lavg = 1.0;
        }

        let mut cursors: Vec<PhraseCursor> = Vec::new();
        for tokens in &phrases {
            for field in [Field::Title, Field::Body] {
                // An unresolvable term makes the phrase unsatisfiable in
                // this field; the phrase then contributes nothing here.
                let Some(terms) = self.resolve_terms(field, tokens)? else {
                    continue;
                };
                let fp = FieldPhrase { field, terms };
                let Some(first) = phrase::next_phrase_doc(&self.store, &fp, None)? else {
                    continue;
                };
                let nt = phrase::phrase_document_frequency(&self.store, &fp)?;
                cursors.push(PhraseCursor {
                    phrase: fp,
                    nt,
                    next_doc: first,
                });
            }
        }

        tracing::debug!(query, cursors = cursors.len(), "query resolved");

        // Min-heap on (next document id, cursor index): candidates come
        // out in ascending document order, each scored exactly once.
        let mut frontier: BinaryHeap<Reverse<(DocId, usize)>> = cursors
            .iter()
            .enumerate()
            .map(|(i, c)| Reverse((c.next_doc, i)))
            .collect();
        let mut top: BinaryHeap<Reverse<Scored>> = BinaryHeap::with_capacity(top_k);

        while let Some(Reverse((doc, idx))) = frontier.pop() {
            let size = self
                .store
                .document(doc)?
                .map(|d| f64::from(d.size))
                .unwrap_or(0.0);
            let mut score = self.contribution(&cursors[idx], doc, size, n, lavg)?;
            self.advance(&mut cursors[idx], idx, doc, &mut frontier)?;
            // Pull every other cursor sitting on the same document before
            // moving on, so the document's total is complete.
            while let Some(&Reverse((d, i))) = frontier.peek() {
                if d != doc {
                    break;
                }
                frontier.pop();
                score += self.contribution(&cursors[i], doc, size, n, lavg)?;
                self.advance(&mut cursors[i], i, doc, &mut frontier)?;
            }

            // Strict > keeps zero-score documents out entirely.
            if score > 0.0 {
                if top.len() < top_k {
                    top.push(Reverse(Scored { score, doc }));
                } else if let Some(Reverse(min)) = top.peek() {
                    if score > min.score {
                        top.pop();
                        top.push(Reverse(Scored { score, doc }));
                    }
                }
            }
        }

        let mut results = Vec::with_capacity(top.len());
        for Reverse(scored) in top.into_sorted_vec() {
            if let Some(result) = self.materialize(scored.doc, scored.score)? {
                results.push(result);
            }
        }
        Ok(results)
    }

    /// Resolve every token of a phrase against one field's dictionary;
    /// `None` when any token is absent (unsatisfiable phrase).
    fn resolve_terms(&self, field: Field, tokens: &[String]) -> Result<Option<Vec<TermId>>> {
        let mut terms = Vec::with_capacity(tokens.len());
        for token in tokens {
            match self.store.term_id(field, token)? {
                Some(id) => terms.push(id),
                None => return Ok(None),
            }
        }
        Ok(Some(terms))
    }

    fn contribution(
        &self,
        cursor: &PhraseCursor,
        doc: DocId,
        size: f64,
        n: f64,
        lavg: f64,
    ) -> Result<f64> {
        let ftd = phrase::phrase_frequency(&self.store, &cursor.phrase, doc)? as f64;
        if ftd == 0.0 || cursor.nt == 0 {
            return Ok(0.0);
        }
        let k = match cursor.phrase.field {
            Field::Title => self.params.k1,
            Field::Body => self.params.k2,
        };
        let b = self.params.b;
        let idf = (n / cursor.nt as f64).ln();
        Ok(idf * ftd * (k + 1.0) / (ftd + k * ((1.0 - b) + b * (size / lavg))))
    }

    fn advance(
        &self,
        cursor: &mut PhraseCursor,
        idx: usize,
        doc: DocId,
        frontier: &mut BinaryHeap<Reverse<(DocId, usize)>>,
    ) -> Result<()> {
        if let Some(next) = phrase::next_phrase_doc(&self.store, &cursor.phrase, Some(doc))? {
            cursor.next_doc = next;
            frontier.push(Reverse((next, idx)));
        }
        Ok(())
    }

    fn materialize(&self, doc: DocId, score: f64) -> Result<Option<SearchResult>> {
        let Some(meta) = self.store.document(doc)? else {
            return Ok(None);
        };
        let keywords = self.keyword_digest(doc, 5)?;
        let mut children = Vec::new();
        for child in self.store.children(doc)?.into_iter().take(4) {
            if let Some(child_doc) = self.store.document(child)? {
                children.push(LinkSummary {
                    title: child_doc.title,
                    url: child_doc.url,
                });
            }
        }
        Ok(Some(SearchResult {
            doc_id: doc,
            score,
            title: meta.title,
            url: meta.url,
            last_modified: meta.last_modified,
            size: meta.size,
            keywords,
            children,
        }))
    }

    /// Top body terms of a document by frequency, from the forward token
    /// record and the reverse dictionary.
    fn keyword_digest(&self, doc: DocId, limit: usize) -> Result<Vec<KeywordCount>> {
        let tokens = self.store.field_tokens(Field::Body, doc)?;
        let mut freq: HashMap<TermId, u32> = HashMap::new();
        for term in tokens {
            *freq.entry(term).or_insert(0) += 1;
        }
        let mut ranked: Vec<(TermId, u32)> = freq.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let mut digest = Vec::new();
        for (term, count) in ranked.into_iter().take(limit) {
            if let Some(word) = self.store.term_word(Field::Body, term)? {
                digest.push(KeywordCount { word, count });
            }
        }
        Ok(digest)
    }
}
