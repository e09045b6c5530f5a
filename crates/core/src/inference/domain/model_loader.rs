use crate::inference::domain::inference_model::InferenceModel;
use crate::inference::resources::DeviceReservation;

pub type LoadError = Box<dyn std::error::Error>;

/// Builds one model replica bound to a worker's reservation.
///
/// Called once per worker, on that worker's own thread.
pub trait ModelLoader: Send + Sync {
    fn load(&self, reservation: &DeviceReservation) -> Result<Box<dyn InferenceModel>, LoadError>;
}

impl<F> ModelLoader for F
where
    F: Fn(&DeviceReservation) -> Result<Box<dyn InferenceModel>, LoadError> + Send + Sync,
{
    fn load(&self, reservation: &DeviceReservation) -> Result<Box<dyn InferenceModel>, LoadError> {
        self(reservation)
    }
}
