use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use track_resolver::config::{PipelineConfig, RemoteConfig};
use track_resolver::local::{IndexedTrack, LocalIndex, LocalIndexResolver};
use track_resolver::models::{QueryMode, SearchType};
use track_resolver::pipeline::{Pipeline, SearchRequest};
use track_resolver::remote::{CatalogClient, CatalogItem, RemoteResolver, Session};
use track_resolver::script::ScriptResolver;
use track_resolver::{Query, Resolver, ResolverError};

const WAIT: Duration = Duration::from_secs(15);

fn beatles_index() -> Arc<LocalIndex> {
    let index = LocalIndex::open_in_memory().unwrap();
    for (title, artist, album) in [
        ("Yesterday", "The Beatles", Some("Help!")),
        ("Help!", "The Beatles", Some("Help!")),
        ("Yesterday", "Ray Charles", None),
        ("Let It Be", "The Beatles", Some("Let It Be")),
    ] {
        index.insert(IndexedTrack::new(title, artist, album)).unwrap();
    }
    Arc::new(index)
}

struct FakeCatalog {
    items: Vec<CatalogItem>,
    calls: AtomicUsize,
}

impl FakeCatalog {
    fn new(items: Vec<CatalogItem>) -> Self {
        Self {
            items,
            calls: AtomicUsize::new(0),
        }
    }
}

impl CatalogClient for FakeCatalog {
    fn search(
        &self,
        _session: &Session,
        _mode: &QueryMode,
        _search_type: SearchType,
    ) -> Result<Vec<CatalogItem>, ResolverError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.items.clone())
    }
}

fn catalog_item(track: &str, album: &str, artist: &str) -> CatalogItem {
    CatalogItem {
        track: track.to_string(),
        album: album.to_string(),
        artist: artist.to_string(),
        score: Some(50.0),
        ..CatalogItem::default()
    }
}

fn local_and_remote() -> Pipeline {
    let mut pipeline = Pipeline::new(4).unwrap();
    let catalog = FakeCatalog::new(vec![catalog_item("Yesterday", "1", "Beatles")]);
    pipeline.register(Arc::new(RemoteResolver::new("remote", catalog, Session::anonymous())));
    pipeline.register(Arc::new(LocalIndexResolver::new("local", beatles_index())));
    pipeline
}

#[test]
fn test_structured_query_merges_local_and_remote() {
    let pipeline = local_and_remote();
    let ids: Vec<&str> = pipeline.resolvers().iter().map(|r| r.id()).collect();
    assert_eq!(ids, vec!["local", "remote"]);

    let query = pipeline.search(&SearchRequest::structured(
        "Yesterday",
        "Help!",
        "The Beatles",
        SearchType::Tracks,
    ));
    assert!(query.wait_settled(WAIT));
    assert!(query.is_solved());

    let ranked = query.ranked_track_candidates();
    assert_eq!(ranked.len(), 3);
    assert_eq!(ranked[0].resolver, "local");
    assert_eq!(ranked[0].score, 1.0);
    assert!(ranked.windows(2).all(|w| w[0].score >= w[1].score));
    assert!(ranked.iter().any(|c| c.resolver == "remote" && !c.only_local));

    assert_eq!(query.display_name(), "Yesterday");
    assert_eq!(query.display_artist().name, "The Beatles");
}

#[test]
fn test_only_local_request_never_reaches_remote() {
    let pipeline = local_and_remote();
    let request = SearchRequest::free_text("let it be", SearchType::Tracks).only_local(true);
    let query = pipeline.search(&request);
    assert!(query.wait_settled(WAIT));

    assert_eq!(query.todo_count(), 1);
    let ranked = query.ranked_track_candidates();
    assert!(!ranked.is_empty());
    assert!(ranked.iter().all(|c| c.only_local));
    assert_eq!(ranked[0].track.name, "Let It Be");
}

#[test]
fn test_album_and_artist_searches() {
    let pipeline = local_and_remote();

    let albums = pipeline.search(&SearchRequest::structured("", "Help!", "The Beatles", SearchType::Albums));
    assert!(albums.wait_settled(WAIT));
    let album_names: Vec<String> = albums.album_results().into_iter().map(|a| a.name).collect();
    assert_eq!(album_names.first().map(String::as_str), Some("Help!"));

    let artists = pipeline.search(&SearchRequest::free_text("beatles", SearchType::Artists));
    assert!(artists.wait_settled(WAIT));
    assert!(artists.is_solved());
    let names: Vec<String> = artists.artist_results().into_iter().map(|a| a.name).collect();
    assert!(names.contains(&"The Beatles".to_string()));
}

#[test]
fn test_unreachable_remote_is_absorbed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tracks.sqlite3");
    {
        let index = LocalIndex::open(&path).unwrap();
        index
            .insert(IndexedTrack::new("Yesterday", "The Beatles", Some("Help!")))
            .unwrap();
    }

    let config = PipelineConfig {
        workers: 2,
        local_index: Some(path),
        remote: Some(RemoteConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            timeout_secs: 2,
            ..RemoteConfig::default()
        }),
        ..PipelineConfig::default()
    };
    let pipeline = Pipeline::from_config(&config).unwrap();

    let query = pipeline.search(&SearchRequest::free_text("yesterday", SearchType::Tracks));
    assert!(query.wait_settled(WAIT));
    let status = query.status();
    assert_eq!((status.todo, status.done), (2, 2));
    assert_eq!(query.ranked_track_candidates().len(), 1);
}

#[test]
fn test_requery_found_tracks() {
    let pipeline = local_and_remote();
    let query = pipeline.search(&SearchRequest::free_text("yesterday", SearchType::Tracks));
    assert!(query.wait_settled(WAIT));

    let follow_ups = query.track_queries();
    assert_eq!(follow_ups.len(), query.ranked_track_candidates().len());
    for follow_up in follow_ups {
        assert!(!follow_up.is_free_text());
        let follow_up = Arc::new(follow_up);
        assert_eq!(pipeline.dispatch(&follow_up, SearchType::Tracks), 2);
        assert!(follow_up.wait_settled(WAIT));
        assert!(follow_up.is_solved());
    }
}

#[test]
fn test_concurrent_searches_keep_counters_consistent() {
    let mut pipeline = Pipeline::new(8).unwrap();
    let index = beatles_index();
    for i in 0..6 {
        pipeline.register(Arc::new(LocalIndexResolver::new(format!("local-{}", i), Arc::clone(&index))));
    }
    let pipeline = Arc::new(pipeline);

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let pipeline = Arc::clone(&pipeline);
            thread::spawn(move || {
                let text = if i % 2 == 0 { "yesterday" } else { "no such song" };
                let query = pipeline.search(&SearchRequest::free_text(text, SearchType::Tracks));
                assert!(query.wait_settled(WAIT));
                let status = query.status();
                assert_eq!(status.todo, 6);
                assert_eq!(status.done, 6);
                assert!(status.solved);
                (i, query.ranked_track_candidates().len())
            })
        })
        .collect();

    for handle in handles {
        let (i, found) = handle.join().unwrap();
        if i % 2 == 0 {
            assert_eq!(found, 12);
        } else {
            assert_eq!(found, 0);
        }
    }
}

#[test]
fn test_solved_events_for_every_query() {
    let pipeline = local_and_remote();
    let events = pipeline.solved_events();

    let queries: Vec<Arc<Query>> = ["yesterday", "help", "let it be"]
        .into_iter()
        .map(|text| pipeline.search(&SearchRequest::free_text(text, SearchType::Tracks)))
        .collect();

    let mut seen: Vec<_> = (0..queries.len())
        .map(|_| events.recv_timeout(WAIT).unwrap().query_id)
        .collect();
    seen.sort();
    let mut expected: Vec<_> = queries.iter().map(|q| q.id()).collect();
    expected.sort();
    assert_eq!(seen, expected);
}

#[cfg(unix)]
#[test]
fn test_script_resolver_from_config() {
    let config = PipelineConfig::parse(
        r#"{
            "workers": 2,
            "scripts": [{
                "name": "echo",
                "command": "sh",
                "args": ["-c", "cat > /dev/null; echo '{\"track\": \"Yesterday\", \"album\": \"Help!\", \"artist\": \"The Beatles\"}'"],
                "local": true,
                "search_types": ["tracks"]
            }]
        }"#,
    )
    .unwrap();
    let pipeline = Pipeline::from_config(&config).unwrap();
    assert_eq!(pipeline.resolvers()[0].priority(), 10);

    let request = SearchRequest::structured("Yesterday", "Help!", "The Beatles", SearchType::Tracks).only_local(true);
    let query = pipeline.search(&request);
    assert!(query.wait_settled(WAIT));
    let best = query.preferred_candidate().unwrap();
    assert_eq!(best.resolver, "echo");
    assert_eq!(best.score, 1.0);

    assert!(pipeline.eligible(false, SearchType::Albums).is_empty());
}

#[cfg(unix)]
#[test]
fn test_hung_scripts_do_not_starve_the_pool() {
    let mut pipeline = Pipeline::new(2).unwrap();
    pipeline.register(Arc::new(LocalIndexResolver::new("local", beatles_index())));
    pipeline.register(Arc::new(
        ScriptResolver::new("hang", "sleep")
            .args(["30"])
            .timeout(Duration::from_millis(500)),
    ));

    let queries: Vec<Arc<Query>> = (0..3)
        .map(|_| pipeline.search(&SearchRequest::free_text("yesterday", SearchType::Tracks)))
        .collect();

    for query in &queries {
        assert!(query.wait_settled(WAIT));
        let status = query.status();
        assert_eq!((status.todo, status.done), (2, 2));
        assert!(status.solved);
        assert_eq!(query.ranked_track_candidates().len(), 2);
    }
}
