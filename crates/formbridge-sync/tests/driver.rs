use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use formbridge_adapters::{
    AdapterError, AnswerType, CsvExportSource, ExtractionRules, RawAnswer, RawSubmission,
    SourceBatch, SubmissionSource,
};
use formbridge_core::{DestinationRecord, FieldKey, SchemaGeneration};
use formbridge_storage::{HttpError, MemoryStore, StatusLabels};
use formbridge_sync::{DecisionKind, SyncDriver, SyncOptions, SyncState};

fn fixture(path: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(path)
}

fn status() -> StatusLabels {
    StatusLabels {
        complete: "Complete".into(),
        partial: "Partial".into(),
    }
}

fn destination() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new(vec![
        DestinationRecord::new("pg-jane", "Jane Smith"),
        DestinationRecord::new("pg-art", "Art Vance").with_value(FieldKey::Email, "art@old.example"),
        DestinationRecord::new("pg-maria", "Maria Martinez"),
        DestinationRecord::new("pg-lee", "Kim Lee"),
    ]))
}

fn driver(store: &Arc<MemoryStore>, options: SyncOptions) -> SyncDriver {
    let rules = ExtractionRules::builtin().expect("rules");
    SyncDriver::new(store.clone(), &rules, status(), options)
}

fn exports() -> Vec<Box<dyn SubmissionSource>> {
    vec![
        Box::new(CsvExportSource::new(fixture("v1/sample.csv"), SchemaGeneration::V1)),
        Box::new(CsvExportSource::new(fixture("v2/sample.csv"), SchemaGeneration::V2)),
    ]
}

struct StaticSource {
    submissions: Vec<RawSubmission>,
}

#[async_trait]
impl SubmissionSource for StaticSource {
    fn label(&self) -> &str {
        "static"
    }

    fn generation(&self) -> SchemaGeneration {
        SchemaGeneration::V2
    }

    async fn fetch(&self) -> Result<SourceBatch, AdapterError> {
        Ok(SourceBatch {
            label: "static".into(),
            generation: SchemaGeneration::V2,
            submissions: self.submissions.clone(),
        })
    }
}

struct RejectedSource;

#[async_trait]
impl SubmissionSource for RejectedSource {
    fn label(&self) -> &str {
        "typeform-api"
    }

    fn generation(&self) -> SchemaGeneration {
        SchemaGeneration::V2
    }

    async fn fetch(&self) -> Result<SourceBatch, AdapterError> {
        Err(HttpError::Unauthorized {
            status: 401,
            url: "https://api.typeform.com/forms/x/responses".into(),
        }
        .into())
    }
}

fn person(first: &str, last: &str, phone: &str) -> RawSubmission {
    let answer = |column: &str, value: &str| RawAnswer {
        field_id: column.into(),
        title: Some(column.into()),
        answer_type: AnswerType::Text,
        value: value.into(),
    };
    RawSubmission {
        answers: vec![
            answer("What's your first name?", first),
            answer("What's your last name?", last),
            answer("What's your phone number?", phone),
        ],
        completed: true,
        submitted_at: Some("2025-05-01 10:00:00".into()),
        response_id: None,
    }
}

#[tokio::test]
async fn exports_fill_matched_records() {
    let store = destination();
    let mut driver = driver(&store, SyncOptions::default());
    let report = driver.run(&exports()).await.expect("run");

    assert_eq!(driver.state(), SyncState::Done);
    assert_eq!(report.processed, 4);
    assert_eq!(report.updated, 4);
    assert_eq!(report.not_found, 0);
    assert_eq!(report.errors, 0);
    assert!(!report.all_failed());
    assert_eq!(report.sources.len(), 2);
    assert_eq!(report.sources[0].label, "v1-csv");
    assert_eq!(report.sources[0].fetched, 3);
    assert_eq!(report.sources[0].extracted, 2);
    assert_eq!(report.sources[1].extracted, 3);
    assert_eq!(report.sources[1].unique, 2);
    assert!(report.fields_added.contains(&"status".to_string()));
    assert!(report
        .fields_added
        .contains(&"profile:Household Notes".to_string()));

    let records = store.records();
    let jane = records.iter().find(|r| r.id == "pg-jane").unwrap();
    assert_eq!(jane.get(&FieldKey::Phone), "512-555-0100");
    assert_eq!(jane.get(&FieldKey::Capabilities), "Cleaning: L2, Laundry: L1");
    assert_eq!(jane.get(&FieldKey::Status), "Complete");
    assert_eq!(jane.get(&FieldKey::Address), "12 Elm St, Apt 2");

    let art = records.iter().find(|r| r.id == "pg-art").unwrap();
    assert_eq!(art.get(&FieldKey::Email), "art@old.example");
    assert_eq!(art.get(&FieldKey::Phone), "303-555-0199");
    assert_eq!(
        art.get(&FieldKey::SchedulingLink),
        "https://calendly.com/art-vance/30min"
    );

    let maria = records.iter().find(|r| r.id == "pg-maria").unwrap();
    assert_eq!(
        maria.get(&FieldKey::Profile("Timing & Travel".into())),
        "Moving: Yes\nMove-In Date: 2025-01-15"
    );

    let lee = records.iter().find(|r| r.id == "pg-lee").unwrap();
    assert_eq!(lee.get(&FieldKey::Autonomy), "Directive");
}

#[tokio::test]
async fn second_run_converges() {
    let store = destination();
    driver(&store, SyncOptions::default())
        .run(&exports())
        .await
        .expect("first run");
    let after_first = store.records();

    let report = driver(&store, SyncOptions::default())
        .run(&exports())
        .await
        .expect("second run");
    assert_eq!(store.records(), after_first);
    // V1 rows carry no always-overwrite fields, so only their status would change
    assert_eq!(report.skipped, 2);
    assert_eq!(report.updated, 2);
    let skipped: Vec<_> = report
        .decisions
        .iter()
        .filter(|d| d.kind == DecisionKind::Skip)
        .map(|d| d.incoming.as_str())
        .collect();
    assert_eq!(skipped, vec!["Art Vance", "Maria Martinez"]);
}

#[tokio::test]
async fn dry_run_plans_without_writing() {
    let store = destination();
    let mut driver = driver(
        &store,
        SyncOptions {
            dry_run: true,
            ..SyncOptions::default()
        },
    );
    let report = driver.run(&exports()).await.expect("run");

    assert!(report.dry_run);
    assert_eq!(report.updated, 4);
    assert!(store.updates().is_empty());
    assert!(store.known_fields().is_empty());
    assert!(report.fields_added.is_empty());
    assert!(report
        .decisions
        .iter()
        .all(|d| d.kind == DecisionKind::Plan));
}

#[tokio::test]
async fn misses_and_name_warnings_are_reported() {
    let store = Arc::new(MemoryStore::new(vec![
        DestinationRecord::new("pg-1", "Sam Beacraft"),
        DestinationRecord::new("pg-2", "Sam Craft"),
    ]));
    let sources: Vec<Box<dyn SubmissionSource>> = vec![Box::new(StaticSource {
        submissions: vec![
            person("Samuel", "Craft", "555-0101"),
            person("Bob", "Unknown", "555-0102"),
            person("", "", "555-0103"),
        ],
    })];
    let report = driver(&store, SyncOptions::default())
        .run(&sources)
        .await
        .expect("run");

    assert_eq!(report.processed, 2);
    assert_eq!(report.updated, 1);
    assert_eq!(report.not_found, 1);
    assert_eq!(report.warnings, 1);
    let updates = store.updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].0, "pg-2");

    let warn = report
        .decisions
        .iter()
        .find(|d| d.kind == DecisionKind::Warn)
        .unwrap();
    assert_eq!(warn.matched.as_deref(), Some("Sam Craft"));
}

#[tokio::test]
async fn failed_updates_are_counted_not_fatal() {
    let store = Arc::new(MemoryStore::new(vec![DestinationRecord::new("pg-1", "Jane Smith")]));
    store.fail_updates_for("pg-1", "validation rejected");
    let sources: Vec<Box<dyn SubmissionSource>> = vec![Box::new(StaticSource {
        submissions: vec![person("Jane", "Smith", "555-1234")],
    })];
    let mut driver = driver(&store, SyncOptions::default());
    let report = driver.run(&sources).await.expect("run completes");

    assert_eq!(driver.state(), SyncState::Done);
    assert_eq!(report.errors, 1);
    assert_eq!(report.updated, 0);
    assert!(report.all_failed());
}

#[tokio::test]
async fn rejected_credentials_abort_before_any_write() {
    let store = destination();
    let sources: Vec<Box<dyn SubmissionSource>> = vec![
        Box::new(CsvExportSource::new(fixture("v2/sample.csv"), SchemaGeneration::V2)),
        Box::new(RejectedSource),
    ];
    let mut driver = driver(&store, SyncOptions::default());
    let err = driver.run(&sources).await.unwrap_err();

    assert!(err.is_auth());
    assert_eq!(driver.state(), SyncState::Aborted);
    assert!(store.updates().is_empty());
}

#[tokio::test]
async fn remote_search_revalidates_whole_words() {
    let store = Arc::new(MemoryStore::new(vec![
        DestinationRecord::new("pg-1", "Maria Martinez"),
        DestinationRecord::new("pg-2", "Jordan Hart"),
    ]));
    let sources: Vec<Box<dyn SubmissionSource>> = vec![Box::new(StaticSource {
        submissions: vec![person("Bo", "Art", "555-0101"), person("Jordan", "Hart", "555-0102")],
    })];
    let report = driver(
        &store,
        SyncOptions {
            remote_search: true,
            ..SyncOptions::default()
        },
    )
    .run(&sources)
    .await
    .expect("run");

    assert_eq!(report.not_found, 1);
    assert_eq!(report.updated, 1);
    assert_eq!(store.updates()[0].0, "pg-2");
}

#[tokio::test]
async fn remote_search_finds_exact_short_names() {
    let store = Arc::new(MemoryStore::new(vec![DestinationRecord::new("pg-1", "Al B")]));
    let sources: Vec<Box<dyn SubmissionSource>> = vec![Box::new(StaticSource {
        submissions: vec![person("Al", "B", "555-0104")],
    })];
    let report = driver(
        &store,
        SyncOptions {
            remote_search: true,
            ..SyncOptions::default()
        },
    )
    .run(&sources)
    .await
    .expect("run");

    assert_eq!(report.not_found, 0);
    assert_eq!(report.updated, 1);
    assert_eq!(store.records()[0].get(&FieldKey::Phone), "555-0104");
}
