//! Blocking reads and writes, serviced on the caller's thread.

use std::time::{Duration, Instant};

use super::processor::{UserArea, UserAreaMut};
use super::realtime::{Servicer, Wait};
use crate::error::{Error, Result};
use crate::hw::{ChannelPlane, Direction};

struct Stall {
    since: Option<Instant>,
    limit: Duration,
}

impl Stall {
    fn new(limit: Duration) -> Self {
        Self { since: None, limit }
    }

    fn progressed(&mut self) {
        self.since = None;
    }

    fn idle(&mut self, direction: Direction) -> Result<()> {
        let since = *self.since.get_or_insert_with(Instant::now);
        if since.elapsed() > self.limit {
            return Err(Error::TimedOut(format!(
                "{direction} device made no progress for {} ms",
                self.limit.as_millis()
            )));
        }
        Ok(())
    }
}

fn check_len(needed: usize, got: usize) -> Result<()> {
    if got < needed {
        return Err(Error::InvalidBuffer { needed, got });
    }
    Ok(())
}

/// Fills `buf` with `frames` captured frames in the user layout.
///
/// Returns `InputOverflowed` when an overrun was recovered on the way; the
/// buffer is complete either way.
pub fn read(servicer: &mut Servicer, buf: &mut [u8], frames: usize, stall: Duration) -> Result<()> {
    let Some(capture) = servicer.capture.as_mut() else {
        return Err(Error::CanNotReadFromAnOutputOnlyStream);
    };
    check_len(capture.user_layout().buffer_bytes(frames), buf.len())?;
    let planes = capture.take_staging(frames);
    let result = read_with(servicer, buf, &planes, frames, stall);
    if let Some(capture) = servicer.capture.as_mut() {
        capture.restore_staging(planes);
    }
    result
}

fn read_with(
    servicer: &mut Servicer,
    buf: &mut [u8],
    planes: &[ChannelPlane],
    frames: usize,
    stall: Duration,
) -> Result<()> {
    let mut stall = Stall::new(stall);
    let mut overflowed = false;
    let mut done = 0;
    while done < frames {
        let avail = match servicer.wait(true, false).map_err(Error::host)? {
            Wait::Frames(avail) => avail,
            Wait::Xrun(direction) => {
                overflowed |= servicer.recover_xrun(direction)?[0];
                continue;
            }
            Wait::Idle => {
                stall.idle(Direction::Capture)?;
                continue;
            }
        };
        let Some(capture) = servicer.capture.as_mut() else {
            return Err(Error::CanNotReadFromAnOutputOnlyStream);
        };
        let layout = capture.user_layout();
        let got = buf.len();
        let mut user = UserAreaMut::new(&mut *buf, planes, layout.format.bytes(), frames).ok_or(
            Error::InvalidBuffer {
                needed: layout.buffer_bytes(frames),
                got,
            },
        )?;
        match capture.capture_into(&mut user, done, avail.min(frames - done)) {
            Ok(0) => stall.idle(Direction::Capture)?,
            Ok(moved) => {
                done += moved;
                stall.progressed();
                servicer.note_transfer();
            }
            Err(err) if err.is_xrun() || err.is_suspended() => {
                overflowed |= servicer.recover_xrun(Direction::Capture)?[0];
            }
            Err(err) => return Err(Error::host(err)),
        }
    }
    if overflowed {
        return Err(Error::InputOverflowed);
    }
    Ok(())
}

/// Queues `frames` frames from `buf` in the user layout.
///
/// Returns `OutputUnderflowed` when an underrun was recovered on the way;
/// all frames are still queued.
pub fn write(servicer: &mut Servicer, buf: &[u8], frames: usize, stall: Duration) -> Result<()> {
    let Some(playback) = servicer.playback.as_mut() else {
        return Err(Error::CanNotWriteToAnInputOnlyStream);
    };
    check_len(playback.user_layout().buffer_bytes(frames), buf.len())?;
    let planes = playback.take_staging(frames);
    let result = write_with(servicer, buf, &planes, frames, stall);
    if let Some(playback) = servicer.playback.as_mut() {
        playback.restore_staging(planes);
    }
    result
}

fn write_with(
    servicer: &mut Servicer,
    buf: &[u8],
    planes: &[ChannelPlane],
    frames: usize,
    stall: Duration,
) -> Result<()> {
    let mut stall = Stall::new(stall);
    let mut underflowed = false;
    let mut done = 0;
    while done < frames {
        let avail = match servicer.wait(false, true).map_err(Error::host)? {
            Wait::Frames(avail) => avail,
            Wait::Xrun(direction) => {
                underflowed |= servicer.recover_xrun(direction)?[1];
                continue;
            }
            Wait::Idle => {
                stall.idle(Direction::Playback)?;
                continue;
            }
        };
        let Some(playback) = servicer.playback.as_mut() else {
            return Err(Error::CanNotWriteToAnInputOnlyStream);
        };
        let layout = playback.user_layout();
        let user = UserArea::new(buf, planes, layout.format.bytes(), frames).ok_or(
            Error::InvalidBuffer {
                needed: layout.buffer_bytes(frames),
                got: buf.len(),
            },
        )?;
        match playback.playback_from(&user, done, avail.min(frames - done)) {
            Ok(0) => stall.idle(Direction::Playback)?,
            Ok(moved) => {
                done += moved;
                stall.progressed();
                servicer.note_transfer();
            }
            Err(err) if err.is_xrun() || err.is_suspended() => {
                underflowed |= servicer.recover_xrun(Direction::Playback)?[1];
            }
            Err(err) => return Err(Error::host(err)),
        }
    }
    if underflowed {
        return Err(Error::OutputUnderflowed);
    }
    Ok(())
}

/// Frames that can be read or written without waiting. A pending xrun is
/// recovered first.
pub fn available(servicer: &mut Servicer, direction: Direction) -> Result<usize> {
    for _ in 0..2 {
        let component = match direction {
            Direction::Capture => servicer.capture.as_mut(),
            Direction::Playback => servicer.playback.as_mut(),
        };
        let Some(component) = component else {
            return Err(match direction {
                Direction::Capture => Error::CanNotReadFromAnOutputOnlyStream,
                Direction::Playback => Error::CanNotWriteToAnInputOnlyStream,
            });
        };
        match component.pcm_mut().avail_update() {
            Ok(frames) => return Ok(frames.max(0) as usize),
            Err(err) if err.is_xrun() || err.is_suspended() => {
                servicer.recover_xrun(direction)?;
            }
            Err(err) => return Err(Error::host(err)),
        }
    }
    Err(Error::TimedOut(format!("{direction} kept overrunning")))
}
