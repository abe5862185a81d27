//! Tests for storage module

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::error::FeedError;
    use crate::types::RawRecord;
    use chrono::{Duration, TimeZone, Utc};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        name: String,
        value: i64,
    }

    async fn exercise_store(store: &dyn DocumentStore) {
        assert!(store.get("entities/AAPL", "info").await.unwrap().is_none());
        assert!(store.list_keys("entities/AAPL").await.unwrap().is_empty());

        save(store, "entities/AAPL", "info", &Doc { name: "Apple".into(), value: 1 })
            .await
            .unwrap();
        save(store, "entities/AAPL", "price", &Doc { name: "px".into(), value: 2 })
            .await
            .unwrap();

        let doc: Doc = load(store, "entities/AAPL", "info").await.unwrap().unwrap();
        assert_eq!(doc.name, "Apple");
        assert_eq!(
            store.list_keys("entities/AAPL").await.unwrap(),
            vec!["info".to_string(), "price".to_string()]
        );

        // Overwrite
        save(store, "entities/AAPL", "info", &Doc { name: "Apple Inc".into(), value: 3 })
            .await
            .unwrap();
        let doc: Doc = load(store, "entities/AAPL", "info").await.unwrap().unwrap();
        assert_eq!(doc.value, 3);

        assert!(store.delete("entities/AAPL", "info").await.unwrap());
        assert!(!store.delete("entities/AAPL", "info").await.unwrap());
        assert_eq!(store.list_keys("entities/AAPL").await.unwrap(), vec!["price".to_string()]);
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryDocumentStore::new();
        exercise_store(&store).await;
        assert_eq!(store.count("entities/AAPL"), 1);
    }

    #[tokio::test]
    async fn test_fs_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsDocumentStore::new(dir.path());
        exercise_store(&store).await;
        assert!(dir.path().join("entities/AAPL/price.json").exists());
    }

    #[tokio::test]
    async fn test_fs_store_ignores_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsDocumentStore::new(dir.path());
        store.put("archive/daily", "2026-01-05", "{}").await.unwrap();
        std::fs::write(dir.path().join("archive/daily/.2026-01-06.json.tmp"), "{").unwrap();
        assert_eq!(
            store.list_keys("archive/daily").await.unwrap(),
            vec!["2026-01-05".to_string()]
        );
    }

    #[tokio::test]
    async fn test_fs_store_rejects_path_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsDocumentStore::new(dir.path());
        let result = store.put("topics", "../escape", "{}").await;
        assert!(matches!(result, Err(FeedError::Validation(_))));
    }

    #[tokio::test]
    async fn test_sqlite_store() {
        let store = SqliteDocumentStore::connect_in_memory().await.unwrap();
        exercise_store(&store).await;
    }

    #[tokio::test]
    async fn test_sqlite_store_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/feeds.db");
        {
            let store = SqliteDocumentStore::connect(&path).await.unwrap();
            store.put("predictions", "stats", "{\"count\":1}").await.unwrap();
        }
        let store = SqliteDocumentStore::connect(&path).await.unwrap();
        assert_eq!(
            store.get("predictions", "stats").await.unwrap().as_deref(),
            Some("{\"count\":1}")
        );
    }

    #[tokio::test]
    async fn test_load_corrupt_document() {
        let store = MemoryDocumentStore::new();
        store.put("archive/daily", "2026-01-05", "{not json").await.unwrap();
        let result = load::<Doc>(&store, "archive/daily", "2026-01-05").await;
        match result {
            Err(FeedError::CorruptRecord { location, .. }) => {
                assert_eq!(location, "archive/daily/2026-01-05");
            }
            other => panic!("expected corrupt record, got {:?}", other),
        }
    }

    fn record(id: &str, minutes: i64) -> RawRecord {
        let base = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        RawRecord::new(id, serde_json::json!({ "title": id }), base + Duration::minutes(minutes))
    }

    #[tokio::test]
    async fn test_topic_store_dedups_and_orders() {
        let store = Arc::new(MemoryDocumentStore::new());
        let topics = TopicStore::new(store, 100, 1000);

        let merged = topics
            .append("news", vec![record("b", 2), record("a", 1), record("c", 3)])
            .await
            .unwrap();
        assert_eq!(merged, 3);

        let merged = topics
            .append("news", vec![record("a", 1), record("d", 4)])
            .await
            .unwrap();
        assert_eq!(merged, 1);

        let recent = topics.recent("news", 10).await.unwrap();
        let ids: Vec<&str> = recent.iter().map(|r| r.natural_id.as_str()).collect();
        assert_eq!(ids, vec!["d", "c", "b", "a"]);
    }

    #[tokio::test]
    async fn test_topic_store_is_bounded() {
        let store = Arc::new(MemoryDocumentStore::new());
        let topics = TopicStore::new(store, 5, 1000);
        let batch: Vec<RawRecord> = (0..12).map(|i| record(&format!("n{}", i), i)).collect();
        topics.append("filings", batch).await.unwrap();

        let feed = topics.feed("filings").await.unwrap();
        assert_eq!(feed.records.len(), 5);
        assert_eq!(feed.records.head().unwrap().natural_id, "n11");
    }

    #[tokio::test]
    async fn test_topic_store_rejects_bad_topic() {
        let store = Arc::new(MemoryDocumentStore::new());
        let topics = TopicStore::new(store, 5, 10);
        assert!(topics.recent("", 5).await.is_err());
    }
}
