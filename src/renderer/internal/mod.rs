pub mod wgpu_device;
