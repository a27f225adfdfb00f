use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use ndarray::{array, Array2};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use super::*;
use crate::{
    channel::BroadcastChannel,
    messages::QcBroadcast,
    storage::{Dataset, MemoryArrayStore},
};

fn enable_logging() {
    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(true)
        .try_init();
}

#[derive(Default)]
struct RecordingReport(Mutex<Vec<String>>);

impl ReportGenerator for RecordingReport {
    fn generate_report(&self, _store: Option<&Path>, output: &str) {
        self.0.lock().unwrap().push(output.to_string());
    }
}

struct Harness {
    orchestrator: TaskOrchestrator<MemoryArrayStore>,
    channel: Arc<BroadcastChannel>,
    report: Arc<RecordingReport>,
}

impl Harness {
    fn new(settings: TaskSettings, clients: &[&str]) -> Self {
        enable_logging();
        let store = AggregationStore::new(MemoryArrayStore::new()).unwrap();
        let ctx = Arc::new(CoordinatorContext::new(ClientRegistry::new(), store));
        let channel = Arc::new(BroadcastChannel::new());
        let report = Arc::new(RecordingReport::default());
        let orchestrator = TaskOrchestrator::new(
            ctx,
            channel.clone(),
            StatsComputer::default(),
            report.clone(),
            settings,
        );
        for client in clients {
            orchestrator.register_client(client, None);
        }
        Self {
            orchestrator,
            channel,
            report,
        }
    }

    fn ctx(&self) -> &CoordinatorContext<MemoryArrayStore> {
        self.orchestrator.context()
    }

    fn state(&self, client: &str) -> TaskState {
        self.ctx().registry.state(client).unwrap()
    }

    fn stats_broadcasts(&self) -> Vec<StatsBroadcast> {
        self.channel
            .on_topic("init/stats")
            .into_iter()
            .map(|broadcast| bincode::deserialize(&broadcast.payload.unwrap()).unwrap())
            .collect()
    }

    fn reports(&self) -> Vec<String> {
        self.report.0.lock().unwrap().clone()
    }
}

fn counts(chrom: &str, n: u64, counts: Array2<i64>, start: bool, end: bool) -> Vec<u8> {
    ClientMessage::Counts {
        task: TaskKind::Init,
        subtask: None,
        chrom: chrom.to_string(),
        n,
        counts,
        start,
        end,
    }
    .encode()
    .unwrap()
}

fn finished(task: TaskKind) -> Vec<u8> {
    ClientMessage::Finished { task }.encode().unwrap()
}

#[tokio::test]
async fn test_init_in_every_order() {
    let permutations = [
        [0, 1, 2],
        [0, 2, 1],
        [1, 0, 2],
        [1, 2, 0],
        [2, 0, 1],
        [2, 1, 0],
    ];
    let clients = ["a", "b", "c"];
    // transmitted (het, hom-alt, missing) of the single locus
    let transmitted = [array![[2, 0, 0]], array![[3, 0, 0]], array![[4, 0, 0]]];

    for order in permutations.iter() {
        let harness = Harness::new(TaskSettings::default(), &clients);
        let run = harness
            .orchestrator
            .start_task(TaskRequest::Init)
            .await
            .unwrap();
        assert_eq!(run.phase(), TaskPhase::Accumulating);
        assert_eq!(harness.channel.on_topic("init").len(), 1);
        assert_eq!(harness.state("a"), TaskState::Init);

        for (delivered, &i) in order.iter().enumerate() {
            let message = counts("1", 10, transmitted[i].clone(), true, true);
            harness
                .orchestrator
                .handle_message(clients[i], &message)
                .await
                .unwrap();
            assert_eq!(harness.state(clients[i]), if delivered < 2 {
                TaskState::InitStats
            } else {
                TaskState::DoneInit
            });
            if delivered < 2 {
                assert_eq!(run.phase(), TaskPhase::Accumulating);
                assert!(harness.stats_broadcasts().is_empty());
            }
        }

        assert_eq!(run.phase(), TaskPhase::Done);
        assert_eq!(harness.ctx().store.total_individuals(), 30);
        assert_eq!(
            harness.ctx().store.counts("1").unwrap(),
            array![[21, 9, 0, 0]]
        );
        let broadcasts = harness.stats_broadcasts();
        assert_eq!(broadcasts.len(), 1);
        assert_eq!(broadcasts[0].chrom, "1");
        assert_eq!(broadcasts[0].subtask, "STATS");
        assert_eq!(broadcasts[0].stats.allele_freq, array![0.15]);
        assert_eq!(broadcasts[0].stats.missing_rates, array![0.0]);
        for client in clients.iter() {
            assert_eq!(harness.state(client), TaskState::DoneInit);
        }
        assert_eq!(harness.reports(), vec!["QC_pre_filter.png"]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_clients() {
    let clients: Vec<String> = (0..8).map(|i| format!("client-{}", i)).collect();
    let names: Vec<&str> = clients.iter().map(String::as_str).collect();
    let harness = Harness::new(TaskSettings::default(), &names);
    let run = harness
        .orchestrator
        .start_task(TaskRequest::Init)
        .await
        .unwrap();

    let handles: Vec<_> = clients
        .iter()
        .cloned()
        .map(|client| {
            let orchestrator = harness.orchestrator.clone();
            tokio::spawn(async move {
                let positions = ClientMessage::Positions {
                    task: TaskKind::Init,
                    chrom: "2".into(),
                    positions: vec![10, 20],
                }
                .encode()
                .unwrap();
                orchestrator.handle_message(&client, &positions).await.unwrap();
                // every client has 5 individuals, chromosome 2 comes in chunks of 3 and 2
                let first = counts("1", 5, array![[1, 0, 0], [0, 1, 1]], true, false);
                orchestrator.handle_message(&client, &first).await.unwrap();
                let second = counts("2", 3, array![[1, 1, 1], [0, 0, 3]], false, false);
                orchestrator.handle_message(&client, &second).await.unwrap();
                let last = counts("2", 2, array![[0, 0, 0], [0, 0, 2]], false, true);
                orchestrator.handle_message(&client, &last).await.unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(run.phase(), TaskPhase::Done);
    let store = &harness.ctx().store;
    assert_eq!(store.total_individuals(), 40);
    assert_eq!(
        store.counts("1").unwrap(),
        array![[32, 8, 0, 0], [24, 0, 8, 8]]
    );
    assert_eq!(
        store.counts("2").unwrap(),
        array![[16, 8, 8, 8], [0, 0, 0, 40]]
    );
    assert_eq!(store.positions("2").unwrap(), array![10, 20]);

    let mut chromosomes: Vec<String> = harness
        .stats_broadcasts()
        .into_iter()
        .map(|broadcast| broadcast.chrom)
        .collect();
    chromosomes.sort();
    assert_eq!(chromosomes, vec!["1", "2"]);
    assert_eq!(harness.reports().len(), 1);
}

#[tokio::test]
async fn test_rejected_messages_do_not_abort_the_task() {
    let harness = Harness::new(TaskSettings::default(), &["a", "b"]);
    let message = counts("1", 4, array![[1, 0, 0]], true, false);
    assert!(matches!(
        harness.orchestrator.handle_message("a", &message).await,
        Err(MessageError::NoActiveTask)
    ));

    let run = harness
        .orchestrator
        .start_task(TaskRequest::Init)
        .await
        .unwrap();
    assert!(matches!(
        harness.orchestrator.handle_message("mallory", &message).await,
        Err(MessageError::UnknownClient(_))
    ));
    assert!(matches!(
        harness.orchestrator.handle_message("a", b"garbage").await,
        Err(MessageError::Malformed(MalformedPartial::Undecodable(_)))
    ));
    assert!(matches!(
        harness
            .orchestrator
            .handle_message("a", &finished(TaskKind::Qc))
            .await,
        Err(MessageError::UnexpectedTask {
            expected: TaskKind::Init,
            got: TaskKind::Qc,
        })
    ));

    harness.orchestrator.handle_message("a", &message).await.unwrap();
    let mismatch = counts("1", 4, array![[1, 0, 0], [1, 0, 0]], true, true);
    assert!(matches!(
        harness.orchestrator.handle_message("b", &mismatch).await,
        Err(MessageError::Malformed(MalformedPartial::RowMismatch { .. }))
    ));
    // the rejected chunk neither counted nor ended b's part
    assert_eq!(harness.ctx().store.total_individuals(), 4);
    assert_eq!(harness.state("b"), TaskState::Init);

    let valid = counts("1", 6, array![[0, 1, 0]], true, true);
    harness.orchestrator.handle_message("b", &valid).await.unwrap();
    harness
        .orchestrator
        .handle_message("a", &finished(TaskKind::Init))
        .await
        .unwrap();
    assert_eq!(run.phase(), TaskPhase::Done);
    assert_eq!(harness.ctx().store.total_individuals(), 10);
    assert_eq!(harness.ctx().store.counts("1").unwrap(), array![[8, 1, 1, 0]]);
}

#[tokio::test]
async fn test_retransmissions() {
    let harness = Harness::new(TaskSettings::default(), &["a", "b"]);
    harness
        .orchestrator
        .start_task(TaskRequest::Init)
        .await
        .unwrap();

    let start = counts("1", 10, array![[2, 0, 0]], true, false);
    harness.orchestrator.handle_message("a", &start).await.unwrap();
    // the channel delivers a's first chunk again
    assert!(matches!(
        harness.orchestrator.handle_message("a", &start).await,
        Err(MessageError::Malformed(
            MalformedPartial::ChunkSizeConflict { .. }
        ))
    ));
    assert_eq!(harness.ctx().store.total_individuals(), 10);

    let end = finished(TaskKind::Init);
    harness.orchestrator.handle_message("a", &end).await.unwrap();
    harness.orchestrator.handle_message("a", &end).await.unwrap();
    assert_eq!(harness.state("a"), TaskState::InitStats);
    assert_eq!(harness.ctx().registry.count_in_state(TaskState::Init), 1);

    // a is done: late chunks are not accepted anymore
    let late = counts("2", 10, array![[1, 0, 0]], false, false);
    assert!(matches!(
        harness.orchestrator.handle_message("a", &late).await,
        Err(MessageError::NotParticipating { .. })
    ));
}

#[tokio::test]
async fn test_only_one_active_run() {
    let harness = Harness::new(TaskSettings::default(), &["a"]);
    let run = harness
        .orchestrator
        .start_task(TaskRequest::Init)
        .await
        .unwrap();
    assert!(matches!(
        harness.orchestrator.start_task(TaskRequest::Init).await,
        Err(OrchestratorError::TaskActive(TaskKind::Init))
    ));
    harness
        .orchestrator
        .handle_message("a", &finished(TaskKind::Init))
        .await
        .unwrap();
    assert_eq!(run.phase(), TaskPhase::Done);
    assert!(harness.orchestrator.supervise(run).await.is_ok());
}

#[tokio::test]
async fn test_no_clients() {
    let harness = Harness::new(TaskSettings::default(), &[]);
    let run = harness
        .orchestrator
        .start_task(TaskRequest::Init)
        .await
        .unwrap();
    assert_eq!(run.phase(), TaskPhase::Done);
    assert!(harness.stats_broadcasts().is_empty());
}

#[tokio::test]
async fn test_qc() {
    let harness = Harness::new(TaskSettings::default(), &["a", "b"]);
    let thresholds = QcThresholds {
        maf: Some(0.05),
        hwe: None,
        missing: Some(0.5),
    };
    assert!(matches!(
        harness
            .orchestrator
            .start_task(TaskRequest::Qc(thresholds))
            .await,
        Err(OrchestratorError::MissingStatistics)
    ));

    harness
        .orchestrator
        .start_task(TaskRequest::Init)
        .await
        .unwrap();
    // locus 0 is monomorphic, locus 1 is mostly missing, locus 2 passes
    let a = counts("1", 5, array![[0, 0, 0], [0, 0, 4], [1, 0, 0]], true, true);
    let b = counts("1", 5, array![[0, 0, 0], [1, 0, 3], [2, 1, 0]], true, true);
    harness.orchestrator.handle_message("a", &a).await.unwrap();
    harness.orchestrator.handle_message("b", &b).await.unwrap();

    let run = harness
        .orchestrator
        .start_task(TaskRequest::Qc(thresholds))
        .await
        .unwrap();
    assert_eq!(harness.state("a"), TaskState::Qc);
    let qc = harness.channel.on_topic("qc");
    assert_eq!(qc.len(), 1);
    let payload: QcBroadcast = bincode::deserialize(qc[0].payload.as_ref().unwrap()).unwrap();
    assert_eq!(payload.chrom, "1");
    assert_eq!(payload.retained, array![false, false, true]);
    assert_eq!(
        harness
            .ctx()
            .store
            .array_store()
            .read("1/retained")
            .unwrap(),
        Some(Dataset::Bool(array![false, false, true]))
    );

    for client in &["a", "b"] {
        harness
            .orchestrator
            .handle_message(client, &finished(TaskKind::Qc))
            .await
            .unwrap();
    }
    assert_eq!(run.phase(), TaskPhase::Done);
    assert_eq!(harness.state("b"), TaskState::DoneQc);
    assert_eq!(
        harness.reports(),
        vec!["QC_pre_filter.png", "QC_post_filter.png"]
    );

    let invalid = QcThresholds {
        maf: Some(2.0),
        ..thresholds
    };
    assert!(matches!(
        harness
            .orchestrator
            .start_task(TaskRequest::Qc(invalid))
            .await,
        Err(OrchestratorError::InvalidThresholds(_))
    ));
}

fn short_deadline(partial_completion: bool) -> TaskSettings {
    TaskSettings {
        stall_warning: 0.05,
        deadline: Some(0.3),
        partial_completion,
        ..TaskSettings::default()
    }
}

#[tokio::test]
async fn test_deadline_with_partial_completion() {
    let harness = Harness::new(short_deadline(true), &["a", "b"]);
    let run = harness
        .orchestrator
        .start_task(TaskRequest::Init)
        .await
        .unwrap();
    let message = counts("1", 10, array![[2, 0, 0]], true, true);
    harness.orchestrator.handle_message("a", &message).await.unwrap();

    let outcome = harness.orchestrator.supervise(run.clone()).await;
    match outcome {
        Err(OrchestratorError::PartialCompletion { task, failed }) => {
            assert_eq!(task, TaskKind::Init);
            assert_eq!(failed, vec!["b"]);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(run.phase(), TaskPhase::Done);
    assert_eq!(harness.state("a"), TaskState::DoneInit);
    assert_eq!(harness.state("b"), TaskState::Failed);
    assert_eq!(harness.stats_broadcasts().len(), 1);

    // b is too late
    assert!(harness
        .orchestrator
        .handle_message("b", &message)
        .await
        .is_err());
}

#[tokio::test]
async fn test_deadline_without_partial_completion() {
    let harness = Harness::new(short_deadline(false), &["a", "b"]);
    let run = harness
        .orchestrator
        .start_task(TaskRequest::Init)
        .await
        .unwrap();
    harness
        .orchestrator
        .handle_message("a", &finished(TaskKind::Init))
        .await
        .unwrap();

    match harness.orchestrator.supervise(run.clone()).await {
        Err(OrchestratorError::BarrierStall { task, pending }) => {
            assert_eq!(task, TaskKind::Init);
            assert_eq!(pending, vec!["b"]);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(run.phase(), TaskPhase::Failed);
    assert_eq!(harness.state("a"), TaskState::InitStats);
    assert!(harness.stats_broadcasts().is_empty());
    assert!(harness.reports().is_empty());

    // the failed run does not block a new one
    let rerun = harness
        .orchestrator
        .start_task(TaskRequest::Init)
        .await
        .unwrap();
    assert_eq!(harness.state("b"), TaskState::Init);
    assert_ne!(rerun.id(), run.id());
}

#[tokio::test]
async fn test_supervision_ends_with_the_run() {
    let harness = Harness::new(
        TaskSettings {
            stall_warning: 0.01,
            ..TaskSettings::default()
        },
        &["a"],
    );
    let run = harness
        .orchestrator
        .start_task(TaskRequest::Init)
        .await
        .unwrap();
    let supervision = tokio::spawn({
        let orchestrator = harness.orchestrator.clone();
        let run = run.clone();
        async move { orchestrator.supervise(run).await }
    });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    harness
        .orchestrator
        .handle_message("a", &finished(TaskKind::Init))
        .await
        .unwrap();
    assert!(supervision.await.unwrap().is_ok());
}
