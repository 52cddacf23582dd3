use anyhow::Result;
use quarry_core::analyzer::analyze;
use quarry_core::phrase::{self, FieldPhrase};
use quarry_core::store::Posting;
use quarry_core::{DocId, DocumentUpdate, Field, SearchEngine, Store};
use std::collections::BTreeSet;
use tempfile::tempdir;

fn index_page(
    store: &Store,
    url: &str,
    title: &str,
    body: &str,
    children: &[&str],
    last_modified: i64,
) -> Result<DocId> {
    let doc = store.resolve_or_create(url)?;
    let mut child_ids = Vec::new();
    for child in children {
        child_ids.push(store.resolve_or_create(child)?.id);
    }
    store.reindex(
        doc.id,
        DocumentUpdate {
            title: Some(title.to_string()),
            content: Some(body.to_string()),
            last_modified,
            title_tokens: analyze(title),
            body_tokens: analyze(body),
            children: child_ids,
        },
    )?;
    Ok(doc.id)
}

fn body_phrase(store: &Store, text: &str) -> FieldPhrase {
    let terms = analyze(text)
        .iter()
        .map(|w| {
            store
                .term_id(Field::Body, w)
                .unwrap()
                .unwrap_or_else(|| panic!("term {w} not in body dictionary"))
        })
        .collect();
    FieldPhrase {
        field: Field::Body,
        terms,
    }
}

#[test]
fn positions_cover_the_field_without_gaps() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path())?;
    let doc = index_page(
        &store,
        "http://x/a",
        "Alpha",
        "green fish swim past green weeds quickly",
        &[],
        1,
    )?;

    let tokens = store.field_tokens(Field::Body, doc)?;
    let size = store.document(doc)?.unwrap().size;
    assert_eq!(tokens.len() as u32, size);

    // Union of posting positions across all terms must be exactly 0..size-1.
    let mut positions = Vec::new();
    for term in tokens.iter().copied().collect::<BTreeSet<_>>() {
        let mut cursor = None;
        while let Some(p) = store.next_posting(Field::Body, term, cursor)? {
            assert_eq!(p.doc, doc);
            positions.push(p.pos);
            cursor = Some(p);
        }
    }
    positions.sort_unstable();
    let expected: Vec<u32> = (0..size).collect();
    assert_eq!(positions, expected);
    Ok(())
}

#[test]
fn frequency_counts_match_postings() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path())?;
    let doc = index_page(
        &store,
        "http://x/a",
        "",
        "red fish blue fish red fish",
        &[],
        1,
    )?;

    let tokens = store.field_tokens(Field::Body, doc)?;
    for term in tokens.iter().copied().collect::<BTreeSet<_>>() {
        let mut postings = 0;
        let mut cursor = None;
        while let Some(p) = store.next_posting(Field::Body, term, cursor)? {
            postings += 1;
            cursor = Some(p);
        }
        assert_eq!(store.term_frequency(Field::Body, term, doc)?, postings);
    }
    let fish = store.term_id(Field::Body, "fish")?.unwrap();
    assert_eq!(store.term_frequency(Field::Body, fish, doc)?, 3);
    Ok(())
}

#[test]
fn next_phrase_finds_contiguous_runs_only() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path())?;
    let doc = index_page(
        &store,
        "http://x/a",
        "",
        "red fish blue whale red fish red whale",
        &[],
        1,
    )?;

    let phrase = body_phrase(&store, "red fish");
    let (u, v) = phrase::next_phrase(&store, &phrase, None)?.expect("first match");
    assert_eq!((u.doc, u.pos), (doc, 0));
    assert_eq!((v.doc, v.pos), (doc, 1));
    assert_eq!(v.pos - u.pos, (phrase.terms.len() - 1) as u32);

    let (u2, v2) = phrase::next_phrase(&store, &phrase, Some(v))?.expect("second match");
    assert_eq!((u2.pos, v2.pos), (4, 5));

    // "red whale" occurs once (positions 6,7); "fish whale" never
    // contiguously even though both terms are present.
    let rw = body_phrase(&store, "red whale");
    let (u3, v3) = phrase::next_phrase(&store, &rw, None)?.expect("match");
    assert_eq!((u3.pos, v3.pos), (6, 7));
    let fw = body_phrase(&store, "fish whale");
    assert!(phrase::next_phrase(&store, &fw, None)?.is_none());

    assert_eq!(phrase::phrase_frequency(&store, &phrase, doc)?, 2);
    assert_eq!(phrase::phrase_document_frequency(&store, &phrase)?, 1);
    Ok(())
}

#[test]
fn phrase_doc_iteration_skips_non_matching_documents() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path())?;
    let a = index_page(&store, "http://x/a", "", "red fish swims", &[], 1)?;
    let _b = index_page(&store, "http://x/b", "", "red whale and blue fish", &[], 1)?;
    let c = index_page(&store, "http://x/c", "", "a red fish again", &[], 1)?;

    let phrase = body_phrase(&store, "red fish");
    let first = phrase::next_phrase_doc(&store, &phrase, None)?.expect("first doc");
    assert_eq!(first, a);
    let second = phrase::next_phrase_doc(&store, &phrase, Some(first))?.expect("second doc");
    assert_eq!(second, c);
    assert!(phrase::next_phrase_doc(&store, &phrase, Some(second))?.is_none());
    assert_eq!(phrase::phrase_document_frequency(&store, &phrase)?, 2);
    Ok(())
}

#[test]
fn reindex_replaces_postings_counts_and_links() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path())?;
    let doc = index_page(
        &store,
        "http://x/a",
        "Old Title",
        "obsolete words here",
        &["http://x/old-child"],
        1,
    )?;

    let obsolete = store.term_id(Field::Body, "obsolet")?.unwrap();
    assert_eq!(store.document_frequency(Field::Body, obsolete)?, 1);

    index_page(
        &store,
        "http://x/a",
        "New Title",
        "fresh words instead",
        &["http://x/new-child"],
        2,
    )?;

    // Old postings and counts are gone, not merged.
    assert_eq!(store.document_frequency(Field::Body, obsolete)?, 0);
    assert_eq!(store.term_frequency(Field::Body, obsolete, doc)?, 0);
    assert!(store
        .next_posting(Field::Body, obsolete, None)?
        .is_none());

    let fresh = store.term_id(Field::Body, "fresh")?.unwrap();
    assert_eq!(store.term_frequency(Field::Body, fresh, doc)?, 1);

    let updated = store.document(doc)?.unwrap();
    assert_eq!(updated.title.as_deref(), Some("New Title"));
    assert_eq!(updated.last_modified, Some(2));
    assert_eq!(updated.size, 3);

    let old_child = store.document_by_url("http://x/old-child")?.unwrap();
    let new_child = store.document_by_url("http://x/new-child")?.unwrap();
    assert_eq!(store.children(doc)?, vec![new_child.id]);
    assert_eq!(store.parents(new_child.id)?, vec![doc]);
    assert!(store.parents(old_child.id)?.is_empty());
    Ok(())
}

#[test]
fn placeholder_documents_have_no_content() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path())?;
    let doc = store.resolve_or_create("http://x/ghost")?;
    assert_eq!(doc.size, 0);
    assert!(doc.title.is_none());
    assert!(doc.last_modified.is_none());
    // Resolving again returns the same document.
    let again = store.resolve_or_create("http://x/ghost")?;
    assert_eq!(again.id, doc.id);
    assert_eq!(store.document_count()?, 1);
    Ok(())
}

#[test]
fn ordered_posting_primitives_respect_strict_bounds() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path())?;
    let a = index_page(&store, "http://x/a", "", "fox fox", &[], 1)?;
    let b = index_page(&store, "http://x/b", "", "fox", &[], 1)?;

    let fox = store.term_id(Field::Body, "fox")?.unwrap();
    let first = store.next_posting(Field::Body, fox, None)?.unwrap();
    assert_eq!((first.doc, first.pos), (a, 0));
    let second = store.next_posting(Field::Body, fox, Some(first))?.unwrap();
    assert_eq!((second.doc, second.pos), (a, 1));
    let third = store.next_posting(Field::Body, fox, Some(second))?.unwrap();
    assert_eq!((third.doc, third.pos), (b, 0));
    assert!(store.next_posting(Field::Body, fox, Some(third))?.is_none());

    assert_eq!(store.prev_posting(Field::Body, fox, third)?, Some(second));
    assert_eq!(store.prev_posting(Field::Body, fox, first)?, None);
    assert_eq!(
        store.prev_posting(Field::Body, fox, Posting { doc: b, pos: 5 })?,
        Some(third)
    );
    Ok(())
}

/// Brute-force scorer over the whole corpus, mirroring the ranking
/// formula, used to validate bounded top-K selection.
fn brute_force_scores(store: &Store, word: &str) -> Result<Vec<(DocId, f64)>> {
    let n = store.document_count()? as f64;
    let lavg = store.average_size()?;
    let term = store.term_id(Field::Body, word)?.unwrap();
    let nt = store.document_frequency(Field::Body, term)? as f64;
    let (k2, b) = (1.2, 0.75);

    let mut scores = Vec::new();
    let mut doc = None;
    while let Some(d) = store.next_doc_with_term(Field::Body, term, doc)? {
        let ftd = store.term_frequency(Field::Body, term, d)? as f64;
        let size = f64::from(store.document(d)?.unwrap().size);
        let score = (n / nt).ln() * ftd * (k2 + 1.0) / (ftd + k2 * ((1.0 - b) + b * (size / lavg)));
        if score > 0.0 {
            scores.push((d, score));
        }
        doc = Some(d);
    }
    scores.sort_by(|x, y| y.1.total_cmp(&x.1));
    Ok(scores)
}

#[test]
fn top_k_matches_brute_force_scan() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path())?;
    index_page(&store, "http://x/1", "", "apple", &[], 1)?;
    index_page(&store, "http://x/2", "", "apple apple apple pear plum", &[], 1)?;
    index_page(&store, "http://x/3", "", "apple apple pear", &[], 1)?;
    index_page(&store, "http://x/4", "", "pear plum cherry", &[], 1)?;
    index_page(
        &store,
        "http://x/5",
        "",
        "apple pear plum cherry quince medlar rowan service",
        &[],
        1,
    )?;

    let expected = brute_force_scores(&store, "appl")?;
    assert!(expected.len() >= 3);

    let engine = SearchEngine::new(store);
    for k in [1, 2, 3, 10] {
        let results = engine.search_top("apple", k)?;
        let want: Vec<DocId> = expected.iter().take(k).map(|(d, _)| *d).collect();
        let got: Vec<DocId> = results.iter().map(|r| r.doc_id).collect();
        assert_eq!(got, want, "top-{k} mismatch");
        for (r, (_, score)) in results.iter().zip(expected.iter()) {
            assert!((r.score - score).abs() < 1e-9);
        }
    }
    // Documents without the term never appear, even with room in the heap.
    let all = engine.search_top("apple", 50)?;
    assert!(all.iter().all(|r| r.url != "http://x/4"));
    Ok(())
}

#[test]
fn scenario_cats_dogs_fish() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path())?;
    index_page(
        &store,
        "http://x/a",
        "Cats and Dogs",
        "all about cats and dogs together",
        &["http://x/b"],
        1,
    )?;
    index_page(
        &store,
        "http://x/b",
        "Dogs",
        "dogs bark at night",
        &["http://x/c"],
        1,
    )?;
    index_page(&store, "http://x/c", "Fish", "fish swim in water", &[], 1)?;

    let engine = SearchEngine::new(store);

    let results = engine.search_top("dogs", 50)?;
    let urls: Vec<&str> = results.iter().map(|r| r.url.as_str()).collect();
    assert!(urls.contains(&"http://x/a"));
    assert!(urls.contains(&"http://x/b"));
    assert!(!urls.contains(&"http://x/c"), "score-0 document must be excluded");

    let phrase_results = engine.search_top("\"cats and\"", 50)?;
    assert_eq!(phrase_results.len(), 1);
    assert_eq!(phrase_results[0].url, "http://x/a");

    // Result materialization: metadata, keyword digest, child summaries.
    let top = &results[0];
    assert!(top.size > 0);
    assert!(top.last_modified.is_some());
    assert!(!top.keywords.is_empty());
    let a = engine
        .search_top("cats", 50)?
        .into_iter()
        .find(|r| r.url == "http://x/a")
        .expect("a matches cats");
    assert_eq!(a.children.len(), 1);
    assert_eq!(a.children[0].url, "http://x/b");
    assert_eq!(a.children[0].title.as_deref(), Some("Dogs"));
    Ok(())
}

#[test]
fn empty_and_unresolvable_queries_return_no_results() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path())?;
    index_page(&store, "http://x/a", "Alpha", "some words", &[], 1)?;
    // A second document keeps N > Nt so matching terms score above zero.
    index_page(&store, "http://x/b", "Beta", "other text", &[], 1)?;
    let engine = SearchEngine::new(store);

    assert!(engine.search_top("", 50)?.is_empty());
    assert!(engine.search_top("the and of", 50)?.is_empty());
    assert!(engine.search_top("zebra quagga", 50)?.is_empty());
    // A phrase with one unknown term is unsatisfiable, but a resolvable
    // loose term alongside it still scores.
    let mixed = engine.search_top("\"some zebra\" words", 50)?;
    assert_eq!(mixed.len(), 1);
    Ok(())
}

#[test]
fn title_and_body_dictionaries_are_independent() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path())?;
    index_page(&store, "http://x/a", "falcon", "sparrow", &[], 1)?;

    assert!(store.term_id(Field::Title, "falcon")?.is_some());
    assert!(store.term_id(Field::Body, "falcon")?.is_none());
    assert!(store.term_id(Field::Body, "sparrow")?.is_some());
    assert!(store.term_id(Field::Title, "sparrow")?.is_none());
    Ok(())
}
