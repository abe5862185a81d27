//! Tests for the archive engine

#[cfg(test)]
mod tests {
    use super::super::source::MockDailySource;
    use super::super::*;
    use crate::aggregate::{AggregateStore, SectionValue};
    use crate::config::{SectionConfig, SectionKind};
    use crate::storage::testing::FlakyStore;
    use crate::storage::{MemoryDocumentStore, TopicStore};
    use crate::types::{RawRecord, SourceTag};
    use chrono::{Datelike, Duration, FixedOffset};
    use serde_json::json;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn engine_with(store: Arc<dyn DocumentStore>, source: MockDailySource) -> ArchiveEngine {
        ArchiveEngine::new(store, Arc::new(source), ArchiveConfig::default()).unwrap()
    }

    fn idle_engine(store: Arc<dyn DocumentStore>) -> ArchiveEngine {
        engine_with(store, MockDailySource::new())
    }

    fn daily(day: NaiveDate, value: Decimal) -> ArchiveEntry {
        let mut summary = PeriodSummary::default();
        summary
            .metrics
            .insert("macro:kospi".into(), MetricSummary::from_values(&[value]).unwrap());
        summary.counts.insert("news".into(), 10);
        ArchiveEntry {
            tier: Tier::Daily,
            period_key: Period::Day(day).key(),
            summary,
            created_at: Utc::now(),
            child_keys: Vec::new(),
            child_summaries: BTreeMap::new(),
            partial: false,
        }
    }

    async fn put_entry(store: &dyn DocumentStore, entry: &ArchiveEntry) {
        save(store, &entry.tier.collection(), &entry.period_key, entry)
            .await
            .unwrap();
    }

    /// Daily entries for Mon 2 March .. Sun 8 March 2026 (ISO week 10)
    async fn seed_week(store: &dyn DocumentStore, skip: Option<u32>) {
        for d in 2..=8 {
            if Some(d) == skip {
                continue;
            }
            put_entry(store, &daily(date(2026, 3, d), Decimal::from(2600 + d))).await;
        }
    }

    fn observation(metrics: Vec<(&str, Vec<Decimal>, Option<Decimal>)>) -> DailyObservation {
        let mut obs = DailyObservation::default();
        for (name, values, reference) in metrics {
            obs.metrics
                .insert(name.to_string(), MetricObservation { values, reference });
        }
        obs.counts.insert("news".into(), 12);
        obs
    }

    #[test]
    fn test_parse_run_at() {
        assert_eq!(parse_run_at("23:50").unwrap(), NaiveTime::from_hms_opt(23, 50, 0).unwrap());
        assert!(matches!(parse_run_at("25:00"), Err(FeedError::Config(_))));
        assert_eq!(event_key(date(2026, 3, 5), "macro:usd/krw"), "2026-03-05_macro_usd_krw");
    }

    #[test]
    fn test_next_run_after() {
        let engine = idle_engine(Arc::new(MemoryDocumentStore::new()));
        let seoul = FixedOffset::east_opt(9 * 3600).unwrap();

        let before = seoul.with_ymd_and_hms(2026, 3, 5, 12, 0, 0).unwrap();
        assert_eq!(
            engine.next_run_after(&before),
            seoul.with_ymd_and_hms(2026, 3, 5, 23, 50, 0).unwrap()
        );
        let after = seoul.with_ymd_and_hms(2026, 3, 5, 23, 55, 0).unwrap();
        assert_eq!(
            engine.next_run_after(&after),
            seoul.with_ymd_and_hms(2026, 3, 6, 23, 50, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_snapshot_day_writes_daily_entry() {
        let store = Arc::new(MemoryDocumentStore::new());
        let mut source = MockDailySource::new();
        source.expect_observe().times(1).returning(|_| {
            Ok(observation(vec![
                ("macro:usdkrw", vec![dec!(1300), dec!(1310)], Some(dec!(1300))),
                ("empty", vec![], None),
            ]))
        });
        let engine = engine_with(store.clone(), source);

        let entry = engine.snapshot_day(date(2026, 3, 5)).await.unwrap();
        assert_eq!(entry.period_key, "2026-03-05");
        assert_eq!(entry.summary.counts["news"], 12);
        assert_eq!(entry.summary.metrics["macro:usdkrw"].last, dec!(1310));
        assert!(!entry.summary.metrics.contains_key("empty"));
        assert!(entry.summary.notable_events.is_empty());

        let stored = engine.entry(Tier::Daily, "2026-03-05").await.unwrap().unwrap();
        assert_eq!(stored, entry);
        assert!(engine.events().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tracked_move_records_event() {
        let store = Arc::new(MemoryDocumentStore::new());
        let mut source = MockDailySource::new();
        source.expect_observe().returning(|_| {
            Ok(observation(vec![
                ("macro:usdkrw", vec![dec!(1330)], Some(dec!(1300))),
                ("equity:aapl", vec![dec!(150)], Some(dec!(100))),
            ]))
        });
        let engine = engine_with(store, source);

        let entry = engine.snapshot_day(date(2026, 3, 5)).await.unwrap();
        assert_eq!(entry.summary.notable_events, vec!["2026-03-05_macro_usdkrw".to_string()]);

        let events = engine.events().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].metric, "macro:usdkrw");
        assert_eq!(events[0].change_pct, dec!(2.3077));
    }

    #[tokio::test]
    async fn test_event_reference_falls_back_to_previous_day() {
        let store = Arc::new(MemoryDocumentStore::new());
        let mut source = MockDailySource::new();
        source.expect_observe().returning(|day| {
            let value = if day.day() == 5 { dec!(80) } else { dec!(78) };
            Ok(observation(vec![("macro:wti", vec![value], None)]))
        });
        let engine = engine_with(store, source);

        let first = engine.snapshot_day(date(2026, 3, 5)).await.unwrap();
        assert!(first.summary.notable_events.is_empty());

        let second = engine.snapshot_day(date(2026, 3, 6)).await.unwrap();
        assert_eq!(second.summary.notable_events.len(), 1);
        let events = engine.events().await.unwrap();
        assert_eq!(events[0].reference, dec!(80));
        assert_eq!(events[0].change_pct, dec!(-2.5));
    }

    #[tokio::test]
    async fn test_seven_days_roll_into_one_week() {
        let store = Arc::new(MemoryDocumentStore::new());
        seed_week(store.as_ref(), None).await;
        put_entry(store.as_ref(), &daily(date(2026, 3, 9), dec!(2700))).await;
        let engine = idle_engine(store.clone());

        // Sunday itself: the week is still open
        let report = engine.compact(date(2026, 3, 8)).await.unwrap();
        assert!(report.written.is_empty());
        assert_eq!(store.count("archive/daily"), 8);

        let report = engine.compact(date(2026, 3, 10)).await.unwrap();
        assert_eq!(report.written, vec!["weekly/2026-W10".to_string()]);
        assert_eq!(report.deleted, 7);
        assert_eq!(report.partial, 0);
        assert_eq!(store.count("archive/daily"), 1);
        assert_eq!(store.count("archive/weekly"), 1);

        let week = engine.entry(Tier::Weekly, "2026-W10").await.unwrap().unwrap();
        assert_eq!(week.child_keys.len(), 7);
        assert!(!week.partial);
        let kospi = &week.summary.metrics["macro:kospi"];
        assert_eq!(kospi.samples, 7);
        assert_eq!(kospi.min, dec!(2602));
        assert_eq!(kospi.last, dec!(2608));
        assert_eq!(kospi.mean, dec!(2605));
        assert_eq!(week.summary.counts["news"], 70);
    }

    #[tokio::test]
    async fn test_failed_weekly_write_deletes_nothing() {
        let store = Arc::new(FlakyStore::new());
        seed_week(store.as_ref(), None).await;
        store.fail_puts("archive/weekly");
        let engine = idle_engine(store.clone());

        let report = engine.compact(date(2026, 3, 10)).await.unwrap();
        assert!(report.written.is_empty());
        assert_eq!(report.deleted, 0);
        assert_eq!(store.inner.count("archive/daily"), 7);

        store.heal();
        let report = engine.compact(date(2026, 3, 10)).await.unwrap();
        assert_eq!(report.deleted, 7);
        assert_eq!(store.inner.count("archive/weekly"), 1);
    }

    #[tokio::test]
    async fn test_incomplete_week_waits_for_retention() {
        let store = Arc::new(MemoryDocumentStore::new());
        seed_week(store.as_ref(), Some(4)).await;
        let engine = idle_engine(store.clone());

        let report = engine.compact(date(2026, 3, 9)).await.unwrap();
        assert!(report.written.is_empty());
        assert_eq!(store.count("archive/daily"), 6);

        let report = engine.compact(date(2026, 3, 12)).await.unwrap();
        assert_eq!(report.partial, 1);
        assert_eq!(report.deleted, 6);
        let week = engine.entry(Tier::Weekly, "2026-W10").await.unwrap().unwrap();
        assert!(week.partial);
        assert_eq!(week.child_keys.len(), 6);
    }

    #[tokio::test]
    async fn test_late_child_is_folded_into_partial_entry() {
        let store = Arc::new(MemoryDocumentStore::new());
        seed_week(store.as_ref(), Some(4)).await;
        let engine = idle_engine(store.clone());
        engine.compact(date(2026, 3, 12)).await.unwrap();

        put_entry(store.as_ref(), &daily(date(2026, 3, 4), dec!(2604))).await;
        let report = engine.compact(date(2026, 3, 12)).await.unwrap();
        assert_eq!(report.written, vec!["weekly/2026-W10".to_string()]);
        assert_eq!(report.deleted, 1);

        let week = engine.entry(Tier::Weekly, "2026-W10").await.unwrap().unwrap();
        assert!(!week.partial);
        assert_eq!(week.child_keys.len(), 7);
        assert_eq!(week.summary.metrics["macro:kospi"].samples, 7);
        assert_eq!(week.summary.metrics["macro:kospi"].last, dec!(2608));
        assert_eq!(store.count("archive/daily"), 0);
    }

    #[tokio::test]
    async fn test_rewritten_daily_is_folded_again() {
        let store = Arc::new(MemoryDocumentStore::new());
        seed_week(store.as_ref(), None).await;
        let engine = idle_engine(store.clone());
        engine.compact(date(2026, 3, 10)).await.unwrap();

        // A corrected snapshot of a day already rolled up
        put_entry(store.as_ref(), &daily(date(2026, 3, 4), dec!(999))).await;

        let report = engine.recover().await.unwrap();
        assert_eq!(report.deleted, 0);
        assert_eq!(store.count("archive/daily"), 1);

        let report = engine.compact(date(2026, 3, 10)).await.unwrap();
        assert_eq!(report.written, vec!["weekly/2026-W10".to_string()]);
        assert_eq!(report.deleted, 1);
        assert_eq!(store.count("archive/daily"), 0);

        let week = engine.entry(Tier::Weekly, "2026-W10").await.unwrap().unwrap();
        let kospi = &week.summary.metrics["macro:kospi"];
        assert_eq!(kospi.samples, 7);
        assert_eq!(kospi.min, dec!(999));
        assert_eq!(kospi.max, dec!(2608));
        assert_eq!(kospi.last, dec!(2608));
        assert_eq!(week.summary.counts["news"], 70);
        assert_eq!(week.child_summaries["2026-03-04"].metrics["macro:kospi"].last, dec!(999));
    }

    #[tokio::test]
    async fn test_empty_observation_keeps_existing_daily() {
        let store = Arc::new(MemoryDocumentStore::new());
        put_entry(store.as_ref(), &daily(date(2026, 3, 4), dec!(2650))).await;

        // No producers have ticked, so the live aggregate observes nothing
        let source = AggregateDailySource::new(Arc::new(AggregateStore::new()));
        let engine = ArchiveEngine::new(store.clone(), Arc::new(source), ArchiveConfig::default()).unwrap();

        let report = engine.run_cycle(date(2026, 3, 4)).await.unwrap();
        assert_eq!(report.daily.as_deref(), Some("2026-03-04"));
        let entry = engine.entry(Tier::Daily, "2026-03-04").await.unwrap().unwrap();
        assert_eq!(entry.summary.metrics["macro:kospi"].last, dec!(2650));
        assert_eq!(entry.summary.counts["news"], 10);
    }

    #[tokio::test]
    async fn test_stored_daily_source_reads_persisted_feeds() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
        save(
            store.as_ref(),
            "snapshots",
            "macro",
            &json!({"value": {"kospi": 2650, "wti": {"price": "78", "previousClose": 80}}, "savedAt": Utc::now()}),
        )
        .await
        .unwrap();
        let topics = TopicStore::new(Arc::clone(&store), 100, 1000);
        let now = Utc::now();
        topics
            .append(
                "news",
                vec![RawRecord::new("n1", json!({}), now), RawRecord::new("n2", json!({}), now)],
            )
            .await
            .unwrap();

        let section = |name: &str, kind: SectionKind| SectionConfig {
            name: name.to_string(),
            kind,
            topic: None,
            capacity: 50,
            dedup_threshold: 500,
            cadence_secs: 60,
            timeout_secs: 10,
        };
        let source = StoredDailySource::new(
            Arc::clone(&store),
            topics,
            vec![
                section("macro", SectionKind::Snapshot),
                section("news", SectionKind::List),
                section("filings", SectionKind::List),
            ],
        );
        let engine = ArchiveEngine::new(Arc::clone(&store), Arc::new(source), ArchiveConfig::default()).unwrap();

        let report = engine.run_cycle(date(2026, 3, 4)).await.unwrap();
        assert_eq!(report.events, 1);
        let entry = engine.entry(Tier::Daily, "2026-03-04").await.unwrap().unwrap();
        assert_eq!(entry.summary.metrics["macro:kospi"].last, dec!(2650));
        assert_eq!(entry.summary.metrics["macro:wti"].last, dec!(78));
        assert_eq!(entry.summary.counts["news"], 2);
        assert!(!entry.summary.counts.contains_key("filings"));
    }

    #[tokio::test]
    async fn test_corrupt_daily_is_treated_as_missing() {
        let store = Arc::new(MemoryDocumentStore::new());
        seed_week(store.as_ref(), None).await;
        store.put("archive/daily", "2026-03-04", "{{{").await.unwrap();
        let engine = idle_engine(store.clone());

        let report = engine.compact(date(2026, 3, 20)).await.unwrap();
        assert_eq!(report.deleted, 6);
        let week = engine.entry(Tier::Weekly, "2026-W10").await.unwrap().unwrap();
        assert!(week.partial);
        assert!(!week.child_keys.contains(&"2026-03-04".to_string()));
        assert_eq!(store.count("archive/daily"), 1);
    }

    #[tokio::test]
    async fn test_weeks_cascade_into_month() {
        let store = Arc::new(MemoryDocumentStore::new());
        let engine = idle_engine(store.clone());
        for (i, week) in (10..=13).enumerate() {
            let period = Period::Week { year: 2026, week };
            let children = period.children();
            let mut summary = PeriodSummary::default();
            summary.metrics.insert(
                "macro:kospi".into(),
                MetricSummary::from_values(&[Decimal::from(2600 + i as i64)]).unwrap(),
            );
            put_entry(
                store.as_ref(),
                &ArchiveEntry {
                    tier: Tier::Weekly,
                    period_key: period.key(),
                    summary,
                    created_at: Utc::now(),
                    child_keys: children.iter().map(Period::key).collect(),
                    child_summaries: BTreeMap::new(),
                    partial: false,
                },
            )
            .await;
        }

        let report = engine.compact(date(2026, 4, 1)).await.unwrap();
        assert_eq!(report.written, vec!["monthly/2026-03".to_string()]);
        assert_eq!(store.count("archive/weekly"), 0);

        let month = engine.entry(Tier::Monthly, "2026-03").await.unwrap().unwrap();
        assert_eq!(month.child_keys, vec!["2026-W10", "2026-W11", "2026-W12", "2026-W13"]);
        assert_eq!(month.summary.metrics["macro:kospi"].last, dec!(2603));
        // The quarter is still open
        assert_eq!(store.count("archive/quarterly"), 0);
    }

    #[tokio::test]
    async fn test_recover_deletes_leftover_children() {
        let store = Arc::new(MemoryDocumentStore::new());
        seed_week(store.as_ref(), None).await;
        let engine = idle_engine(store.clone());

        // Simulate a crash after the weekly write: entry present, children not yet deleted
        let children: Vec<ArchiveEntry> = engine.entries(Tier::Daily).await.unwrap();
        let week = ArchiveEntry {
            tier: Tier::Weekly,
            period_key: "2026-W10".into(),
            summary: PeriodSummary::rollup(children.iter().map(|c| &c.summary)),
            created_at: Utc::now(),
            child_keys: children.iter().map(|c| c.period_key.clone()).collect(),
            child_summaries: children
                .iter()
                .map(|c| (c.period_key.clone(), c.summary.clone()))
                .collect(),
            partial: false,
        };
        put_entry(store.as_ref(), &week).await;

        let report = engine.recover().await.unwrap();
        assert_eq!(report.deleted, 7);
        assert!(report.rebuilt.is_empty());
        assert_eq!(store.count("archive/daily"), 0);
        assert_eq!(engine.entry(Tier::Weekly, "2026-W10").await.unwrap(), Some(week));
    }

    #[tokio::test]
    async fn test_recover_rebuilds_unreadable_entry() {
        let store = Arc::new(MemoryDocumentStore::new());
        seed_week(store.as_ref(), None).await;
        store.put("archive/weekly", "2026-W10", "truncated").await.unwrap();
        let engine = idle_engine(store.clone());

        // Compaction refuses to touch the unreadable entry
        let report = engine.compact(date(2026, 3, 20)).await.unwrap();
        assert!(report.written.is_empty());
        assert_eq!(store.count("archive/daily"), 7);

        let report = tokio_test::assert_ok!(engine.recover().await);
        assert_eq!(report.rebuilt, vec!["weekly/2026-W10".to_string()]);
        assert_eq!(report.deleted, 7);

        let week = engine.entry(Tier::Weekly, "2026-W10").await.unwrap().unwrap();
        assert!(!week.partial);
        assert_eq!(week.summary.metrics["macro:kospi"].samples, 7);
    }

    #[tokio::test]
    async fn test_run_cycle_compacts_when_snapshot_fails() {
        let store = Arc::new(MemoryDocumentStore::new());
        seed_week(store.as_ref(), None).await;
        let mut source = MockDailySource::new();
        source
            .expect_observe()
            .returning(|_| Err(FeedError::upstream("macro", "connection reset")));
        let engine = engine_with(store.clone(), source);

        let report = engine.run_cycle(date(2026, 3, 10)).await.unwrap();
        assert_eq!(report.daily, None);
        assert_eq!(report.compaction.written.len(), 1);
        assert_eq!(store.count("archive/daily"), 0);
    }

    #[tokio::test]
    async fn test_run_cycle_is_idempotent() {
        let store = Arc::new(MemoryDocumentStore::new());
        let mut source = MockDailySource::new();
        source
            .expect_observe()
            .returning(|_| Ok(observation(vec![("macro:kospi", vec![dec!(2650)], None)])));
        let engine = engine_with(store.clone(), source);

        engine.run_cycle(date(2026, 3, 5)).await.unwrap();
        let first = engine.entry(Tier::Daily, "2026-03-05").await.unwrap().unwrap();
        engine.run_cycle(date(2026, 3, 5)).await.unwrap();
        let second = engine.entry(Tier::Daily, "2026-03-05").await.unwrap().unwrap();

        assert_eq!(first.summary, second.summary);
        assert_eq!(store.count("archive/daily"), 1);
    }

    #[tokio::test]
    async fn test_entry_rejects_bad_key() {
        let engine = idle_engine(Arc::new(MemoryDocumentStore::new()));
        let err = engine.entry(Tier::Daily, "2026-3-5").await.unwrap_err();
        assert!(matches!(err, FeedError::Validation(_)));
        assert!(engine.entry(Tier::Yearly, "2025").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_archive_job_runs_a_cycle() {
        let store = Arc::new(MemoryDocumentStore::new());
        let mut source = MockDailySource::new();
        source.expect_observe().times(1).returning(|_| Ok(DailyObservation::default()));
        let engine = Arc::new(engine_with(store.clone(), source));

        let job = ArchiveJob::new(engine);
        assert_eq!(job.name(), "archive");
        job.run().await.unwrap();
        assert_eq!(store.count("archive/daily"), 1);
    }

    #[tokio::test]
    async fn test_aggregate_daily_source() {
        let aggregate = Arc::new(AggregateStore::new());
        let macro_handle = aggregate.register_section("macro", SectionKind::Snapshot).unwrap();
        let news_handle = aggregate.register_section("news", SectionKind::List).unwrap();
        let _idle = aggregate.register_section("idle", SectionKind::List).unwrap();

        let now = Utc::now();
        macro_handle.replace(
            SectionValue::Snapshot(json!({
                "usdkrw": 1342.5,
                "wti": {"price": "78.10", "previousClose": 80},
                "note": "closed early"
            })),
            SourceTag::Live,
            now,
        );
        news_handle.replace(
            SectionValue::List(vec![
                RawRecord::new("n1", json!({}), now),
                RawRecord::new("n2", json!({}), now - Duration::minutes(1)),
            ]),
            SourceTag::Live,
            now,
        );

        let source = AggregateDailySource::new(aggregate);
        let observed = source.observe(now.date_naive()).await.unwrap();
        assert_eq!(observed.counts.get("news"), Some(&2));
        assert!(!observed.counts.contains_key("idle"));
        assert_eq!(observed.metrics["macro:usdkrw"].values, vec![dec!(1342.5)]);
        assert_eq!(observed.metrics["macro:wti"].reference, Some(dec!(80)));
        assert!(!observed.metrics.contains_key("macro:note"));
    }
}
