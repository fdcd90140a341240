use anyhow::{anyhow, Result};

/// Nanoseconds per second; the sink clock unit.
pub const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// Timing metadata attached to one emitted frame, in nanoseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameTiming {
    pub pts: u64,
    pub dts: u64,
    pub duration: u64,
    pub offset: u64,
}

/// Synthetic presentation clock.
///
/// Every tick advances by exactly one frame duration, whatever the wall clock
/// did in between. Starts at zero and never goes back.
#[derive(Clone, Debug)]
pub struct PublisherClock {
    fps: u32,
    frame_duration: u64,
    ticks: u64,
}

impl PublisherClock {
    pub fn new(fps: u32) -> Result<Self> {
        if fps == 0 {
            return Err(anyhow!("publisher fps must be greater than zero"));
        }
        Ok(Self {
            fps,
            frame_duration: NANOS_PER_SECOND / u64::from(fps),
            ticks: 0,
        })
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn frame_duration(&self) -> u64 {
        self.frame_duration
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Timestamp the next frame will get.
    pub fn next_pts(&self) -> u64 {
        self.ticks.saturating_mul(self.frame_duration)
    }

    pub fn tick(&mut self) -> FrameTiming {
        let pts = self.next_pts();
        self.ticks += 1;
        FrameTiming {
            pts,
            dts: pts,
            duration: self.frame_duration,
            offset: pts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_fps() {
        assert!(PublisherClock::new(0).is_err());
    }

    #[test]
    fn ticks_are_evenly_spaced_from_zero() {
        let mut clock = PublisherClock::new(30).unwrap();
        assert_eq!(clock.frame_duration(), 33_333_333);
        let first = clock.tick();
        assert_eq!(first.pts, 0);
        assert_eq!(first.dts, 0);
        assert_eq!(first.duration, 33_333_333);
        let mut prev = first.pts;
        for _ in 0..100 {
            let t = clock.tick();
            assert_eq!(t.pts - prev, clock.frame_duration());
            assert_eq!(t.pts, t.dts);
            assert_eq!(t.offset, t.pts);
            prev = t.pts;
        }
        assert_eq!(clock.ticks(), 101);
    }

    #[test]
    fn sixty_fps_matches_integer_second_division() {
        let mut clock = PublisherClock::new(60).unwrap();
        clock.tick();
        assert_eq!(clock.tick().pts, NANOS_PER_SECOND / 60);
    }
}
