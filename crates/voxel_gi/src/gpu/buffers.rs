use std::time::{Duration, Instant};

use crate::error::{Result, VoxelGiError};

/// Maps `buffer` for reading and copies its words out, polling the device
/// until the map completes or `timeout` expires (`Ok(None)`).
pub(crate) fn map_buffer_words(
    buffer: &wgpu::Buffer,
    device: &wgpu::Device,
    timeout: Duration,
) -> Result<Option<Vec<u32>>> {
    let slice = buffer.slice(..);
    let (sender, mut receiver) = futures::channel::oneshot::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = sender.send(result);
    });

    let started = Instant::now();
    loop {
        device.poll(wgpu::Maintain::Poll);
        match receiver.try_recv() {
            Ok(Some(Ok(()))) => break,
            Ok(Some(Err(err))) => return Err(VoxelGiError::Device(format!("map failed: {err}"))),
            Ok(None) if started.elapsed() >= timeout => {
                buffer.unmap();
                return Ok(None);
            }
            Ok(None) => std::thread::yield_now(),
            Err(_) => return Err(VoxelGiError::Device("map callback dropped".into())),
        }
    }

    let data = slice.get_mapped_range();
    let words = bytemuck::cast_slice(&data).to_vec();
    drop(data);
    buffer.unmap();
    Ok(Some(words))
}
