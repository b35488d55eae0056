//! Background scene loading.
//!
//! The load runs on its own thread and reports through a channel; the frame
//! loop polls it instead of joining, so rendering never blocks on I/O.

use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, TryRecvError};

use crate::core::SceneGeometry;
use crate::error::{Result, VoxelGiError};

/// Where a background load stands.
#[derive(Debug)]
pub enum LoadStatus {
    Pending,
    Ready(SceneGeometry),
    Failed(VoxelGiError),
    /// The result was already handed out by an earlier poll.
    Delivered,
}

pub struct SceneLoader {
    label: String,
    results: Receiver<Result<SceneGeometry>>,
    worker: Option<JoinHandle<()>>,
    delivered: bool,
}

impl SceneLoader {
    /// Starts `load` on a named worker thread.
    pub fn spawn<F>(label: impl Into<String>, load: F) -> Result<Self>
    where
        F: FnOnce() -> Result<SceneGeometry> + Send + 'static,
    {
        let label = label.into();
        let (sender, results) = crossbeam_channel::bounded(1);
        let worker = std::thread::Builder::new()
            .name(format!("scene-loader:{label}"))
            .spawn(move || {
                let _ = sender.send(load());
            })
            .map_err(|err| VoxelGiError::Loader(format!("spawning loader '{label}' failed: {err}")))?;
        Ok(Self {
            label,
            results,
            worker: Some(worker),
            delivered: false,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_delivered(&self) -> bool {
        self.delivered
    }

    /// Never blocks; the worker is joined once its result has arrived.
    pub fn poll(&mut self) -> LoadStatus {
        if self.delivered {
            return LoadStatus::Delivered;
        }
        let outcome = match self.results.try_recv() {
            Ok(outcome) => outcome,
            Err(TryRecvError::Empty) => return LoadStatus::Pending,
            Err(TryRecvError::Disconnected) => Err(VoxelGiError::Loader(format!(
                "loader '{}' exited without a result",
                self.label
            ))),
        };
        self.delivered = true;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        match outcome {
            Ok(scene) => LoadStatus::Ready(scene),
            Err(err) => LoadStatus::Failed(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use std::time::{Duration, Instant};

    fn poll_until_done(loader: &mut SceneLoader) -> LoadStatus {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            match loader.poll() {
                LoadStatus::Pending if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(1)),
                status => return status,
            }
        }
    }

    #[test]
    fn delivers_the_scene_once() {
        let mut loader = SceneLoader::spawn("one", || {
            Ok(SceneGeometry {
                triangles: vec![[Vec3::ZERO, Vec3::X, Vec3::Y]],
                colors: None,
            })
        })
        .unwrap();
        match poll_until_done(&mut loader) {
            LoadStatus::Ready(scene) => assert_eq!(scene.triangles.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(loader.poll(), LoadStatus::Delivered));
    }

    #[test]
    fn pending_until_the_worker_sends() {
        let (release, gate) = crossbeam_channel::bounded::<()>(0);
        let mut loader = SceneLoader::spawn("gated", move || {
            let _ = gate.recv();
            Ok(SceneGeometry::default())
        })
        .unwrap();
        assert!(matches!(loader.poll(), LoadStatus::Pending));
        release.send(()).unwrap();
        assert!(matches!(poll_until_done(&mut loader), LoadStatus::Ready(_)));
    }

    #[test]
    fn reports_errors_and_panics() {
        let mut failing = SceneLoader::spawn("err", || Err(VoxelGiError::Loader("missing file".into()))).unwrap();
        assert!(matches!(poll_until_done(&mut failing), LoadStatus::Failed(VoxelGiError::Loader(_))));

        let mut panicking = SceneLoader::spawn("panic", || panic!("loader blew up")).unwrap();
        assert!(matches!(poll_until_done(&mut panicking), LoadStatus::Failed(VoxelGiError::Loader(_))));
    }
}
