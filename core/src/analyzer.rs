use lazy_static::lazy_static;
use regex::Regex;
use rust_stemmers::{Algorithm, Stemmer};
use std::collections::HashSet;
use unicode_normalization::UnicodeNormalization;

lazy_static! {
    static ref WORD: Regex = Regex::new(r"(?u)\p{L}[\p{L}\p{N}_']*").expect("valid regex");
    static ref QUOTED: Regex = Regex::new(r#""([^"]*)""#).expect("valid regex");
    static ref STEMMER: Stemmer = Stemmer::create(Algorithm::English);
    static ref STOPWORDS: HashSet<&'static str> = {
        let words: &[&str] = &[
            "a","about","above","after","again","against","all","am","an","and","any","are","aren't","as","at",
            "be","because","been","before","being","below","between","both","but","by",
            "can","can't","cannot","could","couldn't",
            "did","didn't","do","does","doesn't","doing","don't","down","during",
            "each","few","for","from","further",
            "had","hadn't","has","hasn't","have","haven't","having","he","he'd","he'll","he's","her","here","here's","hers","herself","him","himself","his","how","how's",
            "i","i'd","i'll","i'm","i've","if","in","into","is","isn't","it","it's","its","itself",
            "let's","me","more","most","mustn't","my","myself",
            "no","nor","not","of","off","on","once","only","or","other","ought","our","ours","ourselves","out","over","own",
            "same","she","she'd","she'll","she's","should","shouldn't","so","some","such",
            "than","that","that's","the","their","theirs","them","themselves","then","there","there's","these","they","they'd","they'll","they're","they've","this","those","through","to","too",
            "under","until","up","very",
            "was","wasn't","we","we'd","we'll","we're","we've","were","weren't","what","what's","when","when's","where","where's","which","while","who","who's","whom","why","why's","with","won't","would","wouldn't",
            "you","you'd","you'll","you're","you've","your","yours","yourself","yourselves"
        ];
        words.iter().copied().collect()
    };
}

fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(token)
}

/// Normalize text into the term stream that gets indexed: NFKC
/// normalization, lowercasing, word extraction, stopword removal and
/// Porter stemming. The position of a term is its index in the returned
/// vector, so positions are contiguous with no gaps.
pub fn analyze(text: &str) -> Vec<String> {
    let normalized = text.nfkc().collect::<String>().to_lowercase();
    WORD.find_iter(&normalized)
        .map(|m| m.as_str())
        .filter(|token| !is_stopword(token))
        .map(|token| STEMMER.stem(token).to_string())
        .collect()
}

/// Split a raw query string into phrases. Each double-quoted segment
/// becomes one multi-term phrase; every word outside quotes stands alone
/// as a single-term phrase. Segments that analyze to nothing are dropped.
pub fn parse_query(query: &str) -> Vec<Vec<String>> {
    let mut phrases = Vec::new();
    let mut loose = String::new();
    let mut last = 0;
    for cap in QUOTED.captures_iter(query) {
        let whole = cap.get(0).expect("whole match");
        loose.push_str(&query[last..whole.start()]);
        loose.push(' ');
        last = whole.end();
        let tokens = analyze(cap.get(1).map_or("", |g| g.as_str()));
        if !tokens.is_empty() {
            phrases.push(tokens);
        }
    }
    loose.push_str(&query[last..]);
    for token in analyze(&loose) {
        phrases.push(vec![token]);
    }
    phrases
}
