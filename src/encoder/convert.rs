//! Camera pixel layouts to planar I420
//!
//! The encoder takes planar YUV 4:2:0. Camera previews arrive as NV21
//! (Y plane, then interleaved V/U) or packed YUYV.

use crate::capture::FrameSize;

/// Length of an I420 frame
pub fn i420_len(size: FrameSize) -> usize {
    size.pixels() + size.pixels() / 2
}

/// Convert NV21 into I420, writing into `out`.
///
/// The Y plane is copied as is; the V/U pairs are split into separate U and
/// V planes. `out` is resized to the I420 length.
pub fn nv21_to_i420(src: &[u8], size: FrameSize, out: &mut Vec<u8>) {
    let y_len = size.pixels();
    let chroma_len = y_len / 4;
    out.resize(i420_len(size), 0);

    let (y_plane, chroma) = out.split_at_mut(y_len);
    let (u_plane, v_plane) = chroma.split_at_mut(chroma_len);

    y_plane.copy_from_slice(&src[..y_len]);

    let vu = &src[y_len..];
    for i in 0..chroma_len {
        v_plane[i] = vu[i * 2];
        u_plane[i] = vu[i * 2 + 1];
    }
}

/// Convert packed YUYV 4:2:2 into I420, writing into `out`.
///
/// Chroma is taken from even rows only.
pub fn yuyv_to_i420(src: &[u8], size: FrameSize, out: &mut Vec<u8>) {
    let width = size.width as usize;
    let height = size.height as usize;
    let y_len = size.pixels();
    out.resize(i420_len(size), 0);

    let (y_plane, chroma) = out.split_at_mut(y_len);
    let (u_plane, v_plane) = chroma.split_at_mut(y_len / 4);

    for row in 0..height {
        let line = &src[row * width * 2..(row + 1) * width * 2];
        for (col, pair) in line.chunks_exact(4).enumerate() {
            y_plane[row * width + col * 2] = pair[0];
            y_plane[row * width + col * 2 + 1] = pair[2];
            if row % 2 == 0 {
                let idx = (row / 2) * (width / 2) + col;
                u_plane[idx] = pair[1];
                v_plane[idx] = pair[3];
            }
        }
    }
}
