use ort::execution_providers::ExecutionProviderDispatch;

use crate::inference::resources::Device;

/// Execution providers for a worker's reserved device.
///
/// CPU reservations use ONNX Runtime's default CPU provider. Accelerator
/// reservations pin the platform provider to the reserved ordinal where the
/// provider supports one; registration failures fall back to CPU.
pub fn for_device(device: Device) -> Vec<ExecutionProviderDispatch> {
    match device {
        Device::Cpu => Vec::new(),
        Device::Accelerator(ordinal) => accelerator_providers(ordinal),
    }
}

#[cfg(target_os = "macos")]
fn accelerator_providers(_ordinal: u32) -> Vec<ExecutionProviderDispatch> {
    vec![ort::execution_providers::CoreMLExecutionProvider::default().build()]
}

#[cfg(target_os = "windows")]
fn accelerator_providers(ordinal: u32) -> Vec<ExecutionProviderDispatch> {
    vec![ort::execution_providers::DirectMLExecutionProvider::default()
        .with_device_id(ordinal as i32)
        .build()]
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn accelerator_providers(ordinal: u32) -> Vec<ExecutionProviderDispatch> {
    vec![ort::execution_providers::CUDAExecutionProvider::default()
        .with_device_id(ordinal as i32)
        .build()]
}
