//! Store-level walkthroughs of the main ingest/query/access flows.

use std::sync::Arc;

use tempfile::TempDir;
use time::macros::datetime;

use cdxstore_core::{surt_canonicalize, Capture};
use cdxstore_index::{AccessRule, CaptureFilter, DataStore, FilterChain, Index};

fn ingest_lines(index: &Index, lines: &[&str]) -> cdxstore_index::Result<usize> {
    let mut batch = index.begin_update();
    for line in lines {
        if let Some(rest) = line.strip_prefix("@alias ") {
            let mut tokens = rest.split_whitespace();
            let (src, dst) = (tokens.next().unwrap(), tokens.next().unwrap());
            batch.put_alias(&surt_canonicalize(src), &surt_canonicalize(dst));
        } else {
            let capture = Capture::from_cdx_line(line).map_err(|e| {
                cdxstore_index::StoreError::Malformed {
                    line: line.to_string(),
                    source: e,
                }
            })?;
            batch.put_capture(&capture)?;
        }
    }
    batch.commit()
}

fn query_lines(index: &Index, url: &str) -> Vec<String> {
    index
        .query(&surt_canonicalize(url))
        .unwrap()
        .map(|c| c.unwrap().to_cdx_line())
        .collect()
}

#[test]
fn single_record_roundtrip() {
    let tmp = TempDir::new().unwrap();
    let store = DataStore::open(tmp.path(), None).unwrap();
    let index = store.index_or_create("c").unwrap();

    let line =
        "- - 20200101000000 http://example.org/ text/html 200 sha1:AAA - - 1234 5678 file.warc.gz";
    assert_eq!(ingest_lines(&index, &[line]).unwrap(), 1);

    let results = query_lines(&index, "http://example.org/");
    assert_eq!(
        results,
        vec![line.replacen('-', "org,example)/", 1)]
    );
}

#[test]
fn captures_of_one_url_come_back_in_timestamp_order() {
    let tmp = TempDir::new().unwrap();
    let store = DataStore::open(tmp.path(), None).unwrap();
    let index = store.index_or_create("c").unwrap();

    ingest_lines(
        &index,
        &[
            "- - 20200102000000 http://example.org/ text/html 200 sha1:BBB - - 10 20 b.warc.gz",
            "- - 20200101000000 http://example.org/ text/html 200 sha1:AAA - - 10 20 a.warc.gz",
        ],
    )
    .unwrap();

    let results = query_lines(&index, "http://example.org/");
    assert_eq!(results.len(), 2);
    assert!(results[0].contains("20200101000000"));
    assert!(results[1].contains("20200102000000"));
}

#[test]
fn alias_redirects_queries_to_the_target() {
    let tmp = TempDir::new().unwrap();
    let store = DataStore::open(tmp.path(), None).unwrap();
    let index = store.index_or_create("c").unwrap();

    ingest_lines(
        &index,
        &[
            "@alias http://old.example.org/ http://new.example.org/",
            "- - 20200101000000 http://new.example.org/ text/html 200 sha1:AAA - - 10 20 a.warc.gz",
        ],
    )
    .unwrap();

    let results = query_lines(&index, "http://old.example.org/");
    assert_eq!(results.len(), 1);
    assert!(results[0].starts_with("org,example,new)/ "));
}

#[test]
fn access_point_filtering_follows_the_rule_policy() {
    let tmp = TempDir::new().unwrap();
    let store = DataStore::open(tmp.path(), None).unwrap();
    let index = store.index_or_create("c").unwrap();
    let access = index.access();

    ingest_lines(
        &index,
        &["- - 20200101000000 http://example.org/page text/html 200 sha1:AAA - - 10 20 a.warc.gz"],
    )
    .unwrap();

    let staff_only = access
        .list_policies()
        .into_iter()
        .find(|p| p.name == "Staff Only")
        .and_then(|p| p.id)
        .unwrap();
    access
        .put_rule(AccessRule {
            id: None,
            policy_id: staff_only,
            surts: vec!["org,example".to_string()],
            captured: None,
            accessed: None,
            period: None,
        })
        .unwrap();

    let now = datetime!(2024-06-01 00:00 UTC);
    let visible = |access_point: &str| -> usize {
        let filter = cdxstore_index::AccessFilter::new(access.clone(), access_point, now);
        index
            .query(&surt_canonicalize("http://example.org/page"))
            .unwrap()
            .filter(|c| filter.accept(c.as_ref().unwrap()).unwrap())
            .count()
    };
    assert_eq!(visible("public"), 0);
    assert_eq!(visible("staff"), 1);
}

#[test]
fn malformed_line_aborts_the_whole_batch() {
    let tmp = TempDir::new().unwrap();
    let store = DataStore::open(tmp.path(), None).unwrap();
    let index = store.index_or_create("c").unwrap();

    let result = ingest_lines(
        &index,
        &[
            "- - 20200101000000 http://example.org/ text/html 200 sha1:AAA - - 10 20 a.warc.gz",
            "only five fields here really",
        ],
    );
    assert!(matches!(
        result,
        Err(cdxstore_index::StoreError::Malformed { .. })
    ));

    // Nothing from the batch is visible.
    assert!(query_lines(&index, "http://example.org/").is_empty());
}

#[test]
fn store_level_filter_applies_to_every_query() {
    struct DropRedirects;

    impl CaptureFilter for DropRedirects {
        fn accept(&self, capture: &Capture) -> cdxstore_index::Result<bool> {
            Ok(capture.status < 300 || capture.status >= 400)
        }
    }

    let tmp = TempDir::new().unwrap();
    let store = DataStore::open(tmp.path(), Some(Arc::new(DropRedirects))).unwrap();
    let index = store.index_or_create("c").unwrap();

    ingest_lines(
        &index,
        &[
            "- - 20200101000000 http://example.org/ text/html 200 sha1:AAA - - 10 20 a.warc.gz",
            "- - 20200102000000 http://example.org/ text/html 301 sha1:BBB http://example.org/x - 10 20 a.warc.gz",
        ],
    )
    .unwrap();

    let mut chain = FilterChain::new();
    chain.push(store.filter().unwrap());
    let survivors: Vec<Capture> = index
        .query(&surt_canonicalize("http://example.org/"))
        .unwrap()
        .map(|c| c.unwrap())
        .filter(|c| chain.accept(c).unwrap())
        .collect();
    assert_eq!(survivors.len(), 1);
    assert_eq!(survivors[0].status, 200);
}
