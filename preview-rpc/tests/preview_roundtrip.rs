//! Orchestrator and worker loop talking over a real loopback socket.
//!
//! The worker runs as a tokio task instead of a child process so the whole
//! exchange stays inside the test binary.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::bytes::Bytes;

use preview_rpc::{
    FnRenderer, Orchestrator, OrchestratorConfig, PreviewRequest, RenderError, Renderer,
    RendererLoader, SpawnError, WorkerError, WorkerLaunch, WorkerProcess, WorkerSpawner,
    run_worker,
};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Renders `width * height` copies of the classpath generation.
struct CountingLoader {
    classpaths: Mutex<Vec<Vec<PathBuf>>>,
}

impl RendererLoader for CountingLoader {
    fn load(&self, roots: &[PathBuf]) -> Result<Arc<dyn Renderer>, RenderError> {
        let mut classpaths = self.classpaths.lock().unwrap();
        classpaths.push(roots.to_vec());
        let generation = classpaths.len() as u8;
        Ok(Arc::new(FnRenderer(
            move |target: &str, width: u32, height: u32| -> Result<Vec<u8>, RenderError> {
                if target == "com.Broken" {
                    return Err(RenderError::Failed {
                        target: target.to_string(),
                        message: "no such preview".to_string(),
                    });
                }
                Ok(vec![generation; (width * height) as usize])
            },
        )))
    }
}

struct TaskWorker(JoinHandle<Result<(), WorkerError>>);

impl WorkerProcess for TaskWorker {
    fn has_exited(&mut self) -> bool {
        self.0.is_finished()
    }

    fn kill(&mut self) {
        self.0.abort();
    }
}

/// Runs the worker loop in-process for each launch.
struct TaskSpawner {
    loader: Arc<CountingLoader>,
    launches: Mutex<Vec<WorkerLaunch>>,
    finished: Arc<AtomicUsize>,
}

impl WorkerSpawner for TaskSpawner {
    fn spawn(&self, launch: &WorkerLaunch) -> Result<Box<dyn WorkerProcess>, SpawnError> {
        self.launches.lock().unwrap().push(launch.clone());
        let loader: Arc<dyn RendererLoader> = self.loader.clone();
        let finished = Arc::clone(&self.finished);
        let port = launch.port;
        Ok(Box::new(TaskWorker(tokio::spawn(async move {
            let result = run_worker(port, loader).await;
            finished.fetch_add(1, Ordering::SeqCst);
            result
        }))))
    }
}

fn spawner() -> Arc<TaskSpawner> {
    Arc::new(TaskSpawner {
        loader: Arc::new(CountingLoader {
            classpaths: Mutex::new(Vec::new()),
        }),
        launches: Mutex::new(Vec::new()),
        finished: Arc::new(AtomicUsize::new(0)),
    })
}

fn request(target: &str, width: u32, height: u32) -> PreviewRequest {
    let classpath = std::env::join_paths(["/project/classes", "/project/lib.jar"]).unwrap();
    PreviewRequest::new(
        "/jre/bin/java",
        "worker.jar",
        classpath.to_str().unwrap(),
        target,
        width,
        height,
    )
}

#[tokio::test]
async fn orchestrator_drives_worker_loop() {
    let spawner = spawner();
    let orchestrator = Orchestrator::bind(OrchestratorConfig::new().with_spawner(spawner.clone()))
        .await
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

    let first = tx.clone();
    orchestrator
        .request_preview(request("com.Foo", 4, 2), move |pixels| {
            first.send(pixels).unwrap();
        })
        .unwrap();
    let pixels = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(pixels, Bytes::from(vec![1u8; 8]));

    let second = tx.clone();
    orchestrator
        .request_preview(request("com.Foo", 3, 3), move |pixels| {
            second.send(pixels).unwrap();
        })
        .unwrap();
    let pixels = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(pixels, Bytes::from(vec![2u8; 9]));

    assert_eq!(spawner.launches.lock().unwrap().len(), 1);
    assert_eq!(
        *spawner.loader.classpaths.lock().unwrap(),
        vec![
            vec![
                PathBuf::from("/project/classes"),
                PathBuf::from("/project/lib.jar")
            ];
            2
        ]
    );

    orchestrator.close().await;
}

#[tokio::test]
async fn failed_worker_is_respawned() {
    let spawner = spawner();
    let orchestrator = Orchestrator::bind(OrchestratorConfig::new().with_spawner(spawner.clone()))
        .await
        .unwrap();
    let launch_count = || spawner.launches.lock().unwrap().len();

    let (broken_tx, mut broken_rx) = mpsc::unbounded_channel::<Bytes>();
    orchestrator
        .request_preview(request("com.Broken", 1, 1), move |pixels| {
            broken_tx.send(pixels).unwrap();
        })
        .unwrap();

    // The render failure ends the first worker task.
    tokio::time::timeout(TIMEOUT, async {
        while spawner.finished.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(launch_count(), 1);

    // The host may still be tearing down the dead connection; keep asking
    // until a replacement worker is launched.
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    tokio::time::timeout(TIMEOUT, async {
        loop {
            let good = tx.clone();
            orchestrator
                .request_preview(request("com.Foo", 2, 2), move |pixels| {
                    let _ = good.send(pixels);
                })
                .unwrap();
            if launch_count() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let pixels = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(pixels.len(), 4);
    assert_eq!(launch_count(), 2);
    assert!(broken_rx.recv().await.is_none());

    orchestrator.close().await;
}
