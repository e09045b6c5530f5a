use std::sync::Arc;

use crate::inference::domain::inference_model::{InferenceError, InferenceModel};
use crate::inference::domain::model_loader::ModelLoader;
use crate::inference::resources::{DeviceReservation, ResourceSpec};
use crate::pipeline::batcher::Batch;
use crate::shared::detection::FrameResult;
use crate::shared::frame::Frame;
use crate::shared::pipeline_error::{PipelineError, WorkerError};

/// Bytes per sample of the float tensor a frame becomes before inference.
const TENSOR_BYTES_PER_SAMPLE: u64 = 4;

/// A worker's exclusive resources: its reservation and its loaded model.
pub struct WorkerSlot {
    reservation: DeviceReservation,
    model: Box<dyn InferenceModel>,
}

/// Stateful executor owning one model replica for its whole lifetime.
///
/// The model is loaded once in [`InferenceWorker::start`] and reused for every
/// batch. A worker serves one batch at a time (`process` takes `&mut self`).
pub struct InferenceWorker {
    slot: WorkerSlot,
}

impl InferenceWorker {
    pub fn start(
        reservation: DeviceReservation,
        loader: &dyn ModelLoader,
    ) -> Result<Self, PipelineError> {
        let model = loader
            .load(&reservation)
            .map_err(|e| PipelineError::ModelLoad {
                worker_id: reservation.worker_id,
                reason: e.to_string(),
            })?;
        log::debug!(
            "Worker {} loaded model on {}",
            reservation.worker_id,
            reservation.device
        );
        Ok(Self {
            slot: WorkerSlot { reservation, model },
        })
    }

    pub fn worker_id(&self) -> usize {
        self.slot.reservation.worker_id
    }

    pub fn reservation(&self) -> &DeviceReservation {
        &self.slot.reservation
    }

    /// Runs the model over a batch, one result per frame in batch order.
    ///
    /// Frames the model cannot take are logged and get an empty result; the
    /// rest of the batch is unaffected.
    pub fn process(&mut self, batch: &Batch) -> Result<Vec<FrameResult>, WorkerError> {
        let worker_id = self.worker_id();
        let frames = batch.frames();

        let mut accepted = Vec::with_capacity(frames.len());
        let mut usable = Vec::with_capacity(frames.len());
        for frame in frames {
            match check_input_format(frame) {
                Ok(()) => {
                    accepted.push(true);
                    usable.push(frame);
                }
                Err(e) => {
                    log::warn!("Worker {worker_id}: {e}; emitting no detections for it");
                    accepted.push(false);
                }
            }
        }

        if let Some(budget) = self.slot.reservation.memory_budget_bytes {
            let required = estimate_tensor_bytes(&usable);
            if required > budget {
                let err = PipelineError::ResourceExhausted { required, budget };
                return Err(WorkerError::ResourceExhausted(err.to_string()));
            }
        }

        let detections = if usable.is_empty() {
            Vec::new()
        } else {
            self.slot.model.infer(&usable).map_err(|e| match e {
                InferenceError::OutOfMemory(msg) => WorkerError::ResourceExhausted(msg),
                InferenceError::Failed(msg) => WorkerError::Crashed(msg),
            })?
        };
        if detections.len() != usable.len() {
            return Err(WorkerError::Crashed(format!(
                "model returned {} results for {} frames",
                detections.len(),
                usable.len()
            )));
        }

        let mut detections = detections.into_iter();
        Ok(frames
            .iter()
            .zip(accepted)
            .map(|(frame, ok)| {
                if ok {
                    FrameResult::new(frame.index(), detections.next().unwrap_or_default())
                } else {
                    FrameResult::empty(frame.index())
                }
            })
            .collect())
    }
}

/// Checks a frame can become a model input: packed RGB with real pixels.
pub fn check_input_format(frame: &Frame) -> Result<(), PipelineError> {
    let reason = if frame.channels() != 3 {
        format!("expected 3 channels, got {}", frame.channels())
    } else if frame.width() == 0 || frame.height() == 0 {
        format!("empty geometry {}x{}", frame.width(), frame.height())
    } else if frame.as_ndarray().is_none() {
        format!(
            "buffer holds {} bytes, {}x{}x3 needs {}",
            frame.data().len(),
            frame.width(),
            frame.height(),
            frame.width() as usize * frame.height() as usize * 3
        )
    } else {
        return Ok(());
    };
    Err(PipelineError::InputFormat {
        index: frame.index(),
        reason,
    })
}

/// Footprint of the float tensor built from `frames` at native resolution.
pub fn estimate_tensor_bytes(frames: &[&Frame]) -> u64 {
    frames
        .iter()
        .map(|f| f.width() as u64 * f.height() as u64 * 3 * TENSOR_BYTES_PER_SAMPLE)
        .sum()
}

/// Reservations plus the loader that turns each into a worker.
///
/// The pool only describes workers; the dispatcher starts them, one thread each.
#[derive(Clone)]
pub struct WorkerPool {
    reservations: Vec<DeviceReservation>,
    loader: Arc<dyn ModelLoader>,
}

impl WorkerPool {
    pub fn new(
        spec: &ResourceSpec,
        concurrency: usize,
        loader: Arc<dyn ModelLoader>,
    ) -> Result<Self, PipelineError> {
        Ok(Self {
            reservations: spec.reserve(concurrency)?,
            loader,
        })
    }

    pub fn size(&self) -> usize {
        self.reservations.len()
    }

    pub fn reservations(&self) -> &[DeviceReservation] {
        &self.reservations
    }

    pub fn loader(&self) -> Arc<dyn ModelLoader> {
        Arc::clone(&self.loader)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::inference::domain::model_loader::LoadError;
    use crate::shared::detection::{BoundingBox, Detection};

    /// Deterministic stand-in model: one detection per frame, labelled from
    /// the frame index.
    pub struct EchoModel {
        pub calls: Arc<AtomicUsize>,
    }

    impl InferenceModel for EchoModel {
        fn infer(&mut self, frames: &[&Frame]) -> Result<Vec<Vec<Detection>>, InferenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(frames
                .iter()
                .map(|f| {
                    vec![Detection {
                        bbox: BoundingBox::new(1.0, 1.0, 4.0, 4.0),
                        label: (f.index() % 3) as u32,
                        score: 0.9,
                    }]
                })
                .collect())
        }
    }

    pub struct EchoLoader {
        pub loads: Arc<AtomicUsize>,
        pub calls: Arc<AtomicUsize>,
    }

    impl EchoLoader {
        pub fn new() -> Self {
            Self {
                loads: Arc::new(AtomicUsize::new(0)),
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl ModelLoader for EchoLoader {
        fn load(&self, _reservation: &DeviceReservation) -> Result<Box<dyn InferenceModel>, LoadError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(EchoModel {
                calls: Arc::clone(&self.calls),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::test_support::EchoLoader;
    use super::*;
    use crate::inference::domain::model_loader::LoadError;
    use crate::inference::resources::Device;

    fn reservation(budget: Option<u64>) -> DeviceReservation {
        DeviceReservation {
            worker_id: 0,
            device: Device::Cpu,
            memory_budget_bytes: budget,
        }
    }

    fn rgb(index: usize) -> Frame {
        Frame::new(vec![10; 4 * 4 * 3], 4, 4, 3, index)
    }

    struct FailingLoader;

    impl ModelLoader for FailingLoader {
        fn load(&self, _r: &DeviceReservation) -> Result<Box<dyn InferenceModel>, LoadError> {
            Err("weights missing".into())
        }
    }

    struct FixedModel(Result<Vec<Vec<crate::shared::detection::Detection>>, InferenceError>);

    impl InferenceModel for FixedModel {
        fn infer(
            &mut self,
            _frames: &[&Frame],
        ) -> Result<Vec<Vec<crate::shared::detection::Detection>>, InferenceError> {
            self.0.clone()
        }
    }

    fn worker_with(model: FixedModel) -> InferenceWorker {
        InferenceWorker {
            slot: WorkerSlot {
                reservation: reservation(None),
                model: Box::new(model),
            },
        }
    }

    #[test]
    fn test_one_result_per_frame_in_order() {
        let loader = EchoLoader::new();
        let mut worker = InferenceWorker::start(reservation(None), &loader).unwrap();
        let batch = Batch::new(0, vec![rgb(4), rgb(5), rgb(6)]);
        let results = worker.process(&batch).unwrap();
        let indices: Vec<usize> = results.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![4, 5, 6]);
        assert!(results.iter().all(|r| r.detections.len() == 1));
    }

    #[test]
    fn test_model_loaded_once_across_batches() {
        let loader = EchoLoader::new();
        let mut worker = InferenceWorker::start(reservation(None), &loader).unwrap();
        for id in 0..3 {
            worker.process(&Batch::new(id, vec![rgb(id)])).unwrap();
        }
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        assert_eq!(loader.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_invalid_frame_gets_empty_result_only() {
        let loader = EchoLoader::new();
        let mut worker = InferenceWorker::start(reservation(None), &loader).unwrap();
        let gray = Frame::new(vec![0; 16], 4, 4, 1, 1);
        let batch = Batch::new(0, vec![rgb(0), gray, rgb(2)]);
        let results = worker.process(&batch).unwrap();
        assert_eq!(results[0].detections.len(), 1);
        assert!(results[1].detections.is_empty());
        assert_eq!(results[1].index, 1);
        assert_eq!(results[2].detections.len(), 1);
    }

    #[test]
    fn test_batch_of_only_invalid_frames_skips_model() {
        let loader = EchoLoader::new();
        let mut worker = InferenceWorker::start(reservation(None), &loader).unwrap();
        let empty = Frame::new(Vec::new(), 0, 0, 3, 0);
        let results = worker.process(&Batch::new(0, vec![empty])).unwrap();
        assert!(results[0].detections.is_empty());
        assert_eq!(loader.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_over_budget_is_resource_exhausted() {
        let loader = EchoLoader::new();
        // Two 4x4 RGB frames need 2 * 4*4*3*4 = 384 bytes.
        let mut worker = InferenceWorker::start(reservation(Some(200)), &loader).unwrap();
        let err = worker
            .process(&Batch::new(0, vec![rgb(0), rgb(1)]))
            .unwrap_err();
        assert!(matches!(err, WorkerError::ResourceExhausted(_)));
        // Half the batch fits.
        assert!(worker.process(&Batch::new(0, vec![rgb(0)])).is_ok());
    }

    #[test]
    fn test_model_oom_maps_to_resource_exhausted() {
        let mut worker = worker_with(FixedModel(Err(InferenceError::OutOfMemory("vram".into()))));
        let err = worker.process(&Batch::new(0, vec![rgb(0)])).unwrap_err();
        assert_eq!(err, WorkerError::ResourceExhausted("vram".into()));
    }

    #[test]
    fn test_model_failure_maps_to_crashed() {
        let mut worker = worker_with(FixedModel(Err(InferenceError::Failed("bad op".into()))));
        let err = worker.process(&Batch::new(0, vec![rgb(0)])).unwrap_err();
        assert_eq!(err, WorkerError::Crashed("bad op".into()));
    }

    #[test]
    fn test_short_model_output_is_crash() {
        let mut worker = worker_with(FixedModel(Ok(vec![])));
        let err = worker.process(&Batch::new(0, vec![rgb(0)])).unwrap_err();
        assert!(matches!(err, WorkerError::Crashed(_)));
    }

    #[test]
    fn test_load_failure_is_model_load_error() {
        let err = InferenceWorker::start(reservation(None), &FailingLoader)
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::ModelLoad { worker_id: 0, .. }));
        assert!(err.to_string().contains("weights missing"));
    }

    #[test]
    fn test_check_input_format_rejects_non_rgb() {
        let frame = Frame::new(vec![0; 12], 2, 2, 3, 9);
        assert!(check_input_format(&frame).is_ok());
        let wrong_channels = Frame::new(vec![0; 16], 2, 2, 4, 9);
        let err = check_input_format(&wrong_channels).unwrap_err();
        assert!(matches!(err, PipelineError::InputFormat { index: 9, .. }));
    }

    #[test]
    fn test_pool_reserves_one_slot_per_worker() {
        let pool = WorkerPool::new(&ResourceSpec::cpu(), 3, Arc::new(EchoLoader::new())).unwrap();
        assert_eq!(pool.size(), 3);
    }
}
