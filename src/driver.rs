//! Application level programs built on the runtime.
//!
//! Each driver registers its actions on every node of a [World][crate::World], then orchestrates waves of
//! invocations and waits on control objects to consume their results:
//! - [kmeans]: distributed Lloyd iterations over points partitioned cyclically across the nodes
//! - [dot_product]: per-element products folded into a sum reduction
//! - [marshalled]: the cost of Fixed versus Raw argument marshalling for a synchronous call
//!
//! Action ids are allocated per driver so several drivers can share one world.
pub mod dot_product;
pub mod kmeans;
pub mod marshalled;

// little endian packing of 32 and 64 bit floats into GAS blocks
pub(crate) fn f32_pairs(bytes: &[u8]) -> Vec<[f32; 2]> {
    bytes
        .chunks_exact(8)
        .map(|c| {
            [
                f32::from_le_bytes([c[0], c[1], c[2], c[3]]),
                f32::from_le_bytes([c[4], c[5], c[6], c[7]]),
            ]
        })
        .collect()
}

pub(crate) fn write_f32_pairs(pairs: &[[f32; 2]], out: &mut [u8]) {
    for (p, c) in pairs.iter().zip(out.chunks_exact_mut(8)) {
        c[..4].copy_from_slice(&p[0].to_le_bytes());
        c[4..].copy_from_slice(&p[1].to_le_bytes());
    }
}

pub(crate) fn f64_pair(bytes: &[u8]) -> Option<(f64, f64)> {
    let x = bytes.get(..8)?.try_into().ok()?;
    let y = bytes.get(8..16)?.try_into().ok()?;
    Some((f64::from_le_bytes(x), f64::from_le_bytes(y)))
}
