//! Temporal windowing of a frame sequence.
//!
//! `slice` is the closed-form description of the windows; `WindowBuffer` is
//! the streaming form used by the workers, which yields the same spans while
//! holding at most `stack_size` frames.

use serde::Serialize;
use std::collections::VecDeque;

/// Half-open frame range `[start, end)` covered by one window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct WindowSpan {
    pub start: usize,
    pub end: usize,
}

impl WindowSpan {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Windows of `stack_size` frames every `step_size` frames. A trailing
/// partial window is dropped, never padded.
pub fn slice(sequence_length: usize, stack_size: usize, step_size: usize) -> Vec<WindowSpan> {
    if stack_size == 0 || step_size == 0 {
        return Vec::new();
    }
    (0..)
        .map(|k| k * step_size)
        .map(|start| WindowSpan {
            start,
            end: start + stack_size,
        })
        .take_while(|span| span.end <= sequence_length)
        .collect()
}

pub fn window_count(sequence_length: usize, stack_size: usize, step_size: usize) -> usize {
    if stack_size == 0 || step_size == 0 || sequence_length < stack_size {
        return 0;
    }
    (sequence_length - stack_size) / step_size + 1
}

/// Accumulates frames and releases full windows as they become available.
pub struct WindowBuffer<T> {
    stack_size: usize,
    step_size: usize,
    frames: VecDeque<T>,
    /// Sequence offset of `frames[0]`.
    offset: usize,
    /// Frames still to discard before the next window starts (step > stack).
    skip: usize,
}

impl<T> WindowBuffer<T> {
    pub fn new(stack_size: usize, step_size: usize) -> Self {
        Self {
            stack_size: stack_size.max(1),
            step_size: step_size.max(1),
            frames: VecDeque::with_capacity(stack_size.max(1)),
            offset: 0,
            skip: 0,
        }
    }

    /// Push the next frame. Returns the span of a completed window, whose
    /// frames are then available through `window()` until the next `push`.
    pub fn push(&mut self, frame: T) -> Option<WindowSpan> {
        if self.frames.len() == self.stack_size {
            self.advance();
        }
        if self.skip > 0 {
            self.skip -= 1;
            self.offset += 1;
            return None;
        }
        self.frames.push_back(frame);
        if self.frames.len() == self.stack_size {
            Some(WindowSpan {
                start: self.offset,
                end: self.offset + self.stack_size,
            })
        } else {
            None
        }
    }

    /// Frames of the most recently completed window.
    pub fn window(&mut self) -> &[T] {
        self.frames.make_contiguous()
    }

    fn advance(&mut self) {
        let drop = self.step_size.min(self.frames.len());
        self.frames.drain(..drop);
        self.offset += drop;
        self.skip = self.step_size - drop;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(len: usize, stack: usize, step: usize) -> Vec<(WindowSpan, Vec<usize>)> {
        let mut buffer = WindowBuffer::new(stack, step);
        let mut out = Vec::new();
        for i in 0..len {
            if let Some(span) = buffer.push(i) {
                out.push((span, buffer.window().to_vec()));
            }
        }
        out
    }

    #[test]
    fn test_slice_non_overlapping() {
        let spans = slice(100, 24, 24);
        let starts: Vec<usize> = spans.iter().map(|s| s.start).collect();
        assert_eq!(starts, vec![0, 24, 48, 72]);
        assert_eq!(spans.last().unwrap().end, 96);
    }

    #[test]
    fn test_slice_stack_larger_than_sequence() {
        assert!(slice(10, 16, 4).is_empty());
        assert_eq!(window_count(10, 16, 4), 0);
    }

    #[test]
    fn test_slice_exact_fit() {
        assert_eq!(slice(64, 64, 64), vec![WindowSpan { start: 0, end: 64 }]);
    }

    #[test]
    fn test_slice_zero_params_do_not_loop() {
        assert!(slice(10, 0, 1).is_empty());
        assert!(slice(10, 1, 0).is_empty());
    }

    #[test]
    fn test_window_count_matches_slice() {
        for len in 1..60 {
            for stack in 1..12 {
                for step in 1..12 {
                    let spans = slice(len, stack, step);
                    assert_eq!(spans.len(), window_count(len, stack, step));
                    assert!(spans.iter().all(|s| s.len() == stack && s.end <= len));
                    assert!(spans.windows(2).all(|w| w[0].start < w[1].start));
                }
            }
        }
    }

    #[test]
    fn test_buffer_matches_slice() {
        for len in 0..50 {
            for stack in 1..9 {
                for step in 1..12 {
                    let streamed = stream(len, stack, step);
                    let spans: Vec<WindowSpan> = streamed.iter().map(|(s, _)| *s).collect();
                    assert_eq!(spans, slice(len, stack, step), "len={len} stack={stack} step={step}");
                    for (span, frames) in streamed {
                        let expected: Vec<usize> = (span.start..span.end).collect();
                        assert_eq!(frames, expected);
                    }
                }
            }
        }
    }

    #[test]
    fn test_buffer_overlapping_windows() {
        let streamed = stream(10, 4, 2);
        let frames: Vec<Vec<usize>> = streamed.into_iter().map(|(_, f)| f).collect();
        assert_eq!(
            frames,
            vec![vec![0, 1, 2, 3], vec![2, 3, 4, 5], vec![4, 5, 6, 7], vec![6, 7, 8, 9]]
        );
    }

    #[test]
    fn test_buffer_gapped_windows() {
        // step > stack discards the frames between windows
        let streamed = stream(12, 2, 5);
        let frames: Vec<Vec<usize>> = streamed.into_iter().map(|(_, f)| f).collect();
        assert_eq!(frames, vec![vec![0, 1], vec![5, 6], vec![10, 11]]);
    }
}
