/// One read window of the marker scan.
///
/// Consecutive windows share `overlap` bytes so a signature straddling a
/// window boundary is still seen whole by one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanWindow {
    pub index: u64,
    pub start: u64,
    pub length: u64,
}

#[derive(Debug, Clone)]
pub struct WindowIter {
    total_len: u64,
    step: u64,
    window_size: u64,
    next_start: u64,
    index: u64,
    done: bool,
}

impl Iterator for WindowIter {
    type Item = ScanWindow;

    fn next(&mut self) -> Option<ScanWindow> {
        if self.done || self.next_start >= self.total_len {
            return None;
        }
        let start = self.next_start;
        let length = (self.total_len - start).min(self.window_size);
        if start + length >= self.total_len {
            self.done = true;
        }
        let window = ScanWindow {
            index: self.index,
            start,
            length,
        };
        self.next_start = start.saturating_add(self.step);
        self.index += 1;
        Some(window)
    }
}

/// Split `total_len` bytes into windows of `window_size` bytes that overlap
/// by `overlap` bytes. An overlap at least as large as the window is clamped
/// so the scan always makes progress.
pub fn windows(total_len: u64, window_size: u64, overlap: u64) -> WindowIter {
    let window_size = window_size.max(1);
    let overlap = overlap.min(window_size - 1);
    WindowIter {
        total_len,
        step: window_size - overlap,
        window_size,
        next_start: 0,
        index: 0,
        done: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_windows_with_overlap() {
        let wins: Vec<ScanWindow> = windows(100, 40, 10).collect();
        assert_eq!(wins.len(), 3);
        assert_eq!((wins[0].start, wins[0].length), (0, 40));
        assert_eq!((wins[1].start, wins[1].length), (30, 40));
        assert_eq!((wins[2].start, wins[2].length), (60, 40));
    }

    #[test]
    fn last_window_is_truncated() {
        let wins: Vec<ScanWindow> = windows(75, 40, 10).collect();
        assert_eq!(wins.len(), 3);
        assert_eq!((wins[2].start, wins[2].length), (60, 15));
        let wins: Vec<ScanWindow> = windows(71, 40, 10).collect();
        assert_eq!(wins.last().map(|w| w.start + w.length), Some(71));
    }

    #[test]
    fn empty_input_has_no_windows() {
        assert_eq!(windows(0, 40, 10).count(), 0);
    }

    #[test]
    fn oversized_overlap_still_progresses() {
        assert_eq!(windows(10, 4, 100).count(), 7);
    }
}
