// Single-dispatch jobs built on the backend
//
// Each job owns its buffers for the duration of one call: write inputs,
// bind, dispatch, read outputs.

use crate::backend::{Buffer, Device, Program};
use crate::search::{pack_block_be, Digest, MAX_MESSAGE_LEN, SHA256_IV};
use anyhow::{Context, Result};
use std::path::Path;

/// Workgroup size of `copy.comp`
pub const COPY_LOCAL_SIZE: u32 = 16;

/// Copy `values` through the identity kernel and read them back
pub fn copy_roundtrip(device: &Device, shader: &Path, values: &[f32]) -> Result<Vec<f32>> {
    let size = std::mem::size_of_val(values) as u64;

    let input = Buffer::new(device, size).context("Failed to create input buffer")?;
    input.write(values)?;
    let output = Buffer::new(device, size).context("Failed to create output buffer")?;

    let mut program = Program::new(device, shader)?;
    program.bind(&[&input, &output])?;
    program.dispatch((values.len() as u32).div_ceil(COPY_LOCAL_SIZE), 1, 1)?;

    Ok(output.read(values.len())?)
}

/// SHA-256 of a message that fits one block, computed by a single invocation
pub fn sha256_once(device: &Device, shader: &Path, message: &[u8]) -> Result<[u8; 32]> {
    let block = pack_block_be(message).with_context(|| {
        format!(
            "message is {} bytes, at most {} fit one block",
            message.len(),
            MAX_MESSAGE_LEN
        )
    })?;

    let state = Buffer::new(device, std::mem::size_of_val(&SHA256_IV) as u64)?;
    state.write(&SHA256_IV)?;
    let data = Buffer::new(device, std::mem::size_of_val(&block) as u64)?;
    data.write(&block)?;

    let mut program = Program::new(device, shader)?;
    program.bind(&[&state, &data])?;
    program.dispatch(1, 1, 1)?;

    let words = state.read::<u32>(SHA256_IV.len())?;
    Ok(Digest::from_words(&words).to_bytes())
}

/// Lowercase hex encoding
pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
