//! Sample buffer helpers.

// -------------------------------------------------------------------------------------------------

/// Set all samples in the given buffer to zero.
#[inline]
pub fn clear_buffer(buffer: &mut [f32]) {
    buffer.iter_mut().for_each(|s| *s = 0.0);
}

/// Multiply all samples in the given buffer with the given factor.
#[inline]
pub fn scale_buffer(buffer: &mut [f32], factor: f32) {
    if factor == 0.0 {
        clear_buffer(buffer);
    } else if factor != 1.0 {
        buffer.iter_mut().for_each(|s| *s *= factor);
    }
}

// -------------------------------------------------------------------------------------------------

/// Copy the given interleaved buffer into a planar one.
/// The planar buffer's layout defines layout of the interleaved buffer (channel and frame count).
pub fn interleaved_to_planar(interleaved: &[f32], planar: &mut [Vec<f32>]) {
    let channel_count = planar.len();
    match channel_count {
        0 => (),
        1 => {
            for (p, i) in planar[0].iter_mut().zip(interleaved) {
                *p = *i;
            }
        }
        2 => {
            let (left, right) = planar.split_at_mut(1);
            for ((l, r), frame) in left[0]
                .iter_mut()
                .zip(right[0].iter_mut())
                .zip(interleaved.chunks_exact(2))
            {
                *l = frame[0];
                *r = frame[1];
            }
        }
        _ => {
            for (channel_index, channel_values) in planar.iter_mut().enumerate() {
                for (value, frame) in channel_values
                    .iter_mut()
                    .zip(interleaved.chunks_exact(channel_count))
                {
                    *value = frame[channel_index];
                }
            }
        }
    }
}

// -------------------------------------------------------------------------------------------------
