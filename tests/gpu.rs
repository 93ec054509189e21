// Device-level tests
//
// Each test returns early when no Vulkan loader, no compute-capable device
// or no compiled kernel is available, so the suite stays green on headless
// CI machines.

use std::path::PathBuf;
use vkcompute::backend::{BindableBuffer, Buffer, Device, Error, Instance, InstanceDesc, Program};
use vkcompute::jobs;
use vkcompute::search::{GpuHasher, Miner, MinerBuffers};

const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

macro_rules! require {
    ($value:expr) => {
        match $value {
            Some(value) => value,
            None => return,
        }
    };
}

fn instance() -> Option<Instance> {
    let _ = env_logger::builder().is_test(true).try_init();

    let desc = InstanceDesc {
        app_name: "vkcompute-tests".to_string(),
        validation: true,
    };
    match Instance::new(&desc) {
        Ok(instance) => Some(instance),
        Err(err) => {
            eprintln!("skipping: {}", err);
            None
        }
    }
}

fn device(instance: &Instance) -> Option<Device<'_>> {
    match instance.first_device() {
        Ok(device) => Some(device),
        Err(err) => {
            eprintln!("skipping: {}", err);
            None
        }
    }
}

fn kernel(name: &str) -> Option<PathBuf> {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("shaders")
        .join(format!("{}.comp.spv", name));
    if path.exists() {
        Some(path)
    } else {
        eprintln!("skipping: {:?} not compiled", path);
        None
    }
}

fn floats(range: std::ops::RangeInclusive<u32>) -> Vec<f32> {
    range.map(|v| v as f32).collect()
}

#[test]
fn copy_kernel_roundtrip() {
    let instance = require!(instance());
    let device = require!(device(&instance));
    let shader = require!(kernel("copy"));

    let values = floats(1..=32);
    let output = jobs::copy_roundtrip(&device, &shader, &values).unwrap();
    assert_eq!(output, values);
}

#[test]
fn dispatch_returns_after_completion() {
    let instance = require!(instance());
    let device = require!(device(&instance));
    let shader = require!(kernel("copy"));

    // Large enough that a non-waiting dispatch would be caught reading zeros
    let values = floats(1..=1 << 18);
    let output = jobs::copy_roundtrip(&device, &shader, &values).unwrap();
    assert_eq!(output.first(), Some(&1.0));
    assert_eq!(output.last(), Some(&((1u32 << 18) as f32)));
    assert_eq!(output, values);
}

#[test]
fn rebinding_replaces_previous_buffers() {
    let instance = require!(instance());
    let device = require!(device(&instance));
    let shader = require!(kernel("copy"));

    let size = 16 * std::mem::size_of::<f32>() as u64;
    let a = Buffer::new(&device, size).unwrap();
    let b = Buffer::new(&device, size).unwrap();
    let c = Buffer::new(&device, size).unwrap();
    let d = Buffer::new(&device, size).unwrap();

    a.write(&floats(1..=16)).unwrap();
    b.write(&[0.0f32; 16]).unwrap();
    c.write(&floats(101..=116)).unwrap();
    d.write(&[0.0f32; 16]).unwrap();

    let mut program = Program::new(&device, &shader).unwrap();
    assert!(!program.is_bound());

    program.bind(&[&a, &b]).unwrap();
    assert_eq!(program.bound_buffers(), &[a.raw_buffer(), b.raw_buffer()]);
    program.dispatch(1, 1, 1).unwrap();
    assert_eq!(b.read::<f32>(16).unwrap(), floats(1..=16));

    program.bind(&[&c, &d]).unwrap();
    assert_eq!(program.bound_buffers(), &[c.raw_buffer(), d.raw_buffer()]);

    // The old pair must not be touched any more
    a.write(&floats(201..=216)).unwrap();
    program.dispatch(1, 1, 1).unwrap();
    assert_eq!(d.read::<f32>(16).unwrap(), floats(101..=116));
    assert_eq!(b.read::<f32>(16).unwrap(), floats(1..=16));
}

#[test]
fn empty_binding_keeps_program_usable() {
    let instance = require!(instance());
    let device = require!(device(&instance));
    let shader = require!(kernel("copy"));

    let mut program = Program::new(&device, &shader).unwrap();
    assert!(matches!(program.bind(&[]), Err(Error::EmptyBinding)));
    assert!(matches!(program.dispatch(1, 1, 1), Err(Error::NotBound)));
}

#[test]
fn released_and_foreign_buffers_are_not_bound() {
    let instance = require!(instance());
    let device = require!(device(&instance));
    let shader = require!(kernel("copy"));
    let other = Device::new(&instance, device.physical_device()).unwrap();

    let mut source = Buffer::new(&device, 64).unwrap();
    let input = std::mem::take(&mut source);
    let output = Buffer::new(&device, 64).unwrap();
    let foreign = Buffer::new(&other, 64).unwrap();

    let mut program = Program::new(&device, &shader).unwrap();
    program.bind(&[&input, &output]).unwrap();
    let bound = [input.raw_buffer(), output.raw_buffer()];

    assert!(matches!(
        program.bind(&[&output, &foreign]),
        Err(Error::ForeignBuffer { binding: 1 })
    ));
    assert_eq!(program.bound_buffers(), &bound);

    assert!(matches!(
        program.bind(&[&source, &output]),
        Err(Error::Released("Buffer"))
    ));
    assert_eq!(program.bound_buffers(), &bound);
}

#[test]
fn out_of_range_access_is_an_error() {
    let instance = require!(instance());
    let device = require!(device(&instance));

    let buffer = Buffer::new(&device, 32 * 4).unwrap();
    assert!(matches!(
        buffer.write(&floats(1..=40)),
        Err(Error::OutOfBounds { requested: 160, size: 128 })
    ));
    assert!(matches!(
        buffer.read::<f32>(33),
        Err(Error::OutOfBounds { .. })
    ));

    buffer.write(&floats(1..=32)).unwrap();
    assert_eq!(buffer.read::<f32>(32).unwrap(), floats(1..=32));
}

#[test]
fn sha256_of_hello() {
    let instance = require!(instance());
    let device = require!(device(&instance));
    let shader = require!(kernel("sha256"));

    let digest = jobs::sha256_once(&device, &shader, b"hello").unwrap();
    assert_eq!(jobs::hex(&digest), HELLO_SHA256);
}

#[test]
fn taken_objects_are_empty() {
    let instance = require!(instance());
    let device = require!(device(&instance));
    let shader = require!(kernel("copy"));

    let mut buffer = Buffer::new(&device, 64).unwrap();
    let moved = std::mem::take(&mut buffer);
    assert!(buffer.is_null());
    assert_eq!(buffer.size(), 0);
    assert!(!moved.is_null());
    assert_eq!(moved.size(), 64);

    let mut program = Program::new(&device, &shader).unwrap();
    let moved_program = std::mem::take(&mut program);
    assert!(program.is_null());
    assert!(!moved_program.is_null());
    assert!(matches!(program.dispatch(1, 1, 1), Err(Error::Released(_))));
}

#[test]
fn buffers_map_one_at_a_time() {
    let instance = require!(instance());
    let device = require!(device(&instance));

    let buffer = Buffer::new(&device, 16).unwrap();
    {
        let mut mapping = buffer.map().unwrap();
        assert!(buffer.is_mapped());
        assert!(matches!(buffer.map(), Err(Error::AlreadyMapped)));
        mapping.as_mut_slice::<u32>().copy_from_slice(&[1, 2, 3, 4]);
    }
    assert!(!buffer.is_mapped());
    assert_eq!(buffer.read::<u32>(4).unwrap(), vec![1, 2, 3, 4]);
}

#[test]
fn oversized_requests_find_no_memory() {
    let instance = require!(instance());
    let device = require!(device(&instance));

    assert_eq!(device.find_host_visible_memory(u64::MAX), None);
    assert!(device.find_host_visible_memory(4).is_some());
}

#[test]
fn missing_kernel_is_an_error() {
    let instance = require!(instance());
    let device = require!(device(&instance));

    let result = Program::new(&device, "shaders/does_not_exist.comp.spv");
    assert!(matches!(result, Err(Error::ShaderRead { .. })));
}

#[test]
fn every_device_is_reported() {
    let instance = require!(instance());

    let devices = instance.devices().unwrap();
    assert!(!devices.is_empty());
    for device in devices {
        match device {
            Ok(device) => assert!(!device.name().is_empty()),
            Err(err) => assert!(matches!(err, Error::NoComputeQueue { .. })),
        }
    }
}

#[test]
fn gpu_miner_hashes_real_sha256() {
    let instance = require!(instance());
    let device = require!(device(&instance));
    let shader = require!(kernel("sha256_miner"));

    let buffers = MinerBuffers::new(&device, 4).unwrap();
    let hasher = GpuHasher::new(&device, &shader, &buffers).unwrap();
    let mut miner = Miner::new(hasher, "o");

    let report = miner.search(b"hell", 1).unwrap();
    let best = report.best.unwrap();
    assert_eq!(best.message, "hello");
    assert_eq!(jobs::hex(&best.digest.to_bytes()), HELLO_SHA256);
    assert_eq!(report.hashes, 1);
}

#[test]
fn gpu_miner_agrees_with_single_block_kernel() {
    let instance = require!(instance());
    let device = require!(device(&instance));
    let miner_shader = require!(kernel("sha256_miner"));
    let single_shader = require!(kernel("sha256"));

    let buffers = MinerBuffers::new(&device, 4).unwrap();
    let hasher = GpuHasher::new(&device, &miner_shader, &buffers).unwrap();
    let mut miner = Miner::new(hasher, "xyz");
    let report = miner.search(b"nonce/", 2).unwrap();

    assert_eq!(report.hashes, 9);
    assert_eq!(report.batches, 3);

    let mut expected: Option<([u8; 32], String)> = None;
    for first in ["x", "y", "z"] {
        for second in ["x", "y", "z"] {
            let message = format!("nonce/{}{}", first, second);
            let digest = jobs::sha256_once(&device, &single_shader, message.as_bytes()).unwrap();
            if expected.as_ref().map_or(true, |(best, _)| digest < *best) {
                expected = Some((digest, message));
            }
        }
    }

    let (digest, message) = expected.unwrap();
    let best = report.best.unwrap();
    assert_eq!(best.message, message);
    assert_eq!(best.digest.to_bytes(), digest);
}
