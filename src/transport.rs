// Copyright (c) 2023 Marek Benc <benc.marek.elektro98@proton.me>
//
// Permission to use, copy, modify, and distribute this software for any
// purpose with or without fee is hereby granted, provided that the above
// copyright notice and this permission notice appear in all copies.
//
// THE SOFTWARE IS PROVIDED "AS IS" AND THE AUTHOR DISCLAIMS ALL WARRANTIES
// WITH REGARD TO THIS SOFTWARE INCLUDING ALL IMPLIED WARRANTIES OF
// MERCHANTABILITY AND FITNESS. IN NO EVENT SHALL THE AUTHOR BE LIABLE FOR
// ANY SPECIAL, DIRECT, INDIRECT, OR CONSEQUENTIAL DAMAGES OR ANY DAMAGES
// WHATSOEVER RESULTING FROM LOSS OF USE, DATA OR PROFITS, WHETHER IN AN
// ACTION OF CONTRACT, NEGLIGENCE OR OTHER TORTIOUS ACTION, ARISING OUT OF
// OR IN CONNECTION WITH THE USE OR PERFORMANCE OF THIS SOFTWARE.
//

use log::{info, warn, error};

use std::io;
use std::sync::{Arc, Mutex};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::thread;

use crate::bitstream::{BitCursor, MemStore, Step};
use crate::tape::TapeImage;


// One logical tape bit is stored as two equal square half-cycles; at the
// nominal 8kHz bit clock a half-cycle lasts 125us.  A logical 1 doubles
// the duration of both halves.
const BIT_CLOCK_HZ: u32 = 8_000;

// Fast winding covers 18 tape-seconds per wall-clock second.
const FAST_WIND_MULTIPLIER: u32 = 18;

// The program search skips this much of the current program's leader, and
// requires the same stretch of steady signal to call something a program
// boundary.
const SEARCH_IGNORE_SECS: f32 = 3.5;
const SEARCH_DETECT_SECS: f32 = 3.5;

// In-flight record chunks; the bounded queue is what pushes back on the
// device feed when the tape-side writer falls behind.
const RECORD_QUEUE_DEPTH: usize = 2;

const TAPE_LOCK_MSG: &str = ".expect() call: The tape image lock is poisoned";

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Direction {
    Forward,
    Backward,
}

// Outcome of a playback fill: either the requested chunk is complete, or
// the tape ran out after the given number of whole bytes.
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Fill {
    Complete,
    EndOfTape(usize),
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Winding {
    Moved,
    Boundary,
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum SearchTick {
    Searching,
    Found,
    Boundary,
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Feed {
    Accepted,
    Ended,
}

// Program boundary detector state; see start_search() for the arming.
struct SearchState {
    majority:    u8,
    seeded:      bool,
    flipped:     bool,
    mismatches:  u32,
    matches:     u32,
    ignore:      u32,
    tolerance:   u32,
    target:      u32,
}

impl SearchState {
    fn idle() -> SearchState {
        SearchState {
            majority:    0,
            seeded:      false,
            flipped:     false,
            mismatches:  0,
            matches:     0,
            ignore:      0,
            tolerance:   0,
            target:      u32::max_value(),
        }
    }
    // Feed one tape bit into the detector; true once the stretch of signal
    // after the last level flip is long enough to be the next program.
    fn classify(&mut self, bit: u8) -> bool {
        if self.ignore > 0 {
            self.ignore -= 1;
            return false;
        }
        if !self.seeded {
            self.majority = bit;
            self.seeded   = true;
        }
        if bit != self.majority {
            self.mismatches += 1;
            if self.mismatches > self.tolerance {
                self.majority   = bit;
                self.matches    = 0;
                self.mismatches = 0;
                self.flipped    = true;
            }
        } else {
            self.mismatches = 0;
            if self.flipped {
                self.matches += 1;
            }
        }

        self.matches > self.target
    }
}

struct RecordWriter {
    feed_tx:  SyncSender<Vec<u8>>,
    handle:   thread::JoinHandle<()>,
}

// The transport deck around an opened tape image: rate-converting
// playback, the two recording strategies, fast winding and the automatic
// program search.
//
// The image sits behind a mutex shared with the record writer thread, so
// position queries stay live while a recording runs.
pub struct TapeTransport {
    tape:         Arc<Mutex<TapeImage>>,
    tape_rate:    u32,
    host_rate:    u32,
    host_time:    i32,
    resume:       bool,
    search:       SearchState,
    bit_convert:  bool,
    writer:       Option<RecordWriter>,
}

impl TapeTransport {
    pub fn new(image: TapeImage) -> TapeTransport {
        let tape_rate = image.sample_rate();

        TapeTransport {
            tape:         Arc::new(Mutex::new(image)),
            tape_rate,
            host_rate:    48_000,
            host_time:    0,
            resume:       false,
            search:       SearchState::idle(),
            bit_convert:  false,
            writer:       None,
        }
    }
    pub fn tape_rate(&self) -> u32 {
        self.tape_rate
    }
    pub fn set_host_rate(&mut self, rate: u32) {
        self.host_rate = rate;
    }
    pub fn set_bit_conversion(&mut self, enabled: bool) {
        self.bit_convert = enabled;
    }
    pub fn bit_pos(&self) -> u32 {
        self.tape.lock().expect(TAPE_LOCK_MSG).bit_pos()
    }
    pub fn total_bits(&self) -> u32 {
        self.tape.lock().expect(TAPE_LOCK_MSG).total_bits()
    }
    pub fn is_write_protected(&self) -> bool {
        self.tape.lock().expect(TAPE_LOCK_MSG).is_write_protected()
    }
    pub fn name(&self) -> String {
        self.tape.lock().expect(TAPE_LOCK_MSG).name()
    }
    // Stop any recording and close the underlying image, persisting its
    // position.
    pub fn close(mut self) {
        self.stop_record();
        if let Ok(mutex) = Arc::try_unwrap(self.tape) {
            match mutex.into_inner() {
                Ok(mut image) => { image.close(); },
                Err(_)        => { error!("The tape image lock was poisoned, skipping the close."); },
            }
        }
    }

    // Convert tape bits into host-clocked sample bits, packed MSB-first,
    // until the output chunk is full or the tape runs out.
    //
    // The fractional relation between the two clocks lives in an integer
    // accumulator: each emitted host bit subtracts the tape rate, each
    // consumed tape bit adds the host rate.  A completed chunk leaves the
    // accumulator in place so the next call resumes mid-tape-bit.
    pub fn fill_chunk(&mut self, out: &mut [u8]) -> io::Result<Fill> {
        let mut tape = self.tape.lock().expect(TAPE_LOCK_MSG);
        let tape_rate = self.tape_rate as i32;
        let host_rate = self.host_rate as i32;

        if !self.resume {
            self.host_time = host_rate / 2;
        }
        self.resume = false;

        let mut byte:   u8    = 0;
        let mut bits:   u32   = 0;
        let mut filled: usize = 0;

        loop {
            let tape_bit = tape.cursor_mut().read();
            while self.host_time > 0 {
                byte = (byte << 1) | tape_bit;
                self.host_time -= tape_rate;
                bits += 1;
                if bits == 8 {
                    bits = 0;
                    out[filled] = byte;
                    filled += 1;
                    if filled == out.len() {
                        self.resume = true;
                        return Ok(Fill::Complete);
                    }
                }
            }
            if tape.cursor_mut().step_forward()? == Step::Boundary {
                return Ok(Fill::EndOfTape(filled));
            }
            self.host_time += host_rate;
        }
    }

    // One fast-wind stride worth of single-bit steps.
    pub fn wind(&mut self, msec: u32, direction: Direction) -> io::Result<Winding> {
        let steps = (self.tape_rate / 1000) * msec * FAST_WIND_MULTIPLIER;
        self.resume = false;

        let mut tape = self.tape.lock().expect(TAPE_LOCK_MSG);
        for _ in 0..steps {
            let moved = match direction {
                Direction::Forward  => tape.cursor_mut().step_forward()?,
                Direction::Backward => tape.cursor_mut().step_backward()?,
            };
            if moved == Step::Boundary {
                return Ok(Winding::Boundary);
            }
        }

        Ok(Winding::Moved)
    }

    // Arm the program boundary search.  The ignore window skips over the
    // leader of the program the tape currently sits in; the noise
    // tolerance grows with the sample rate, since a single flipped sample
    // means less the faster the tape was sampled.
    pub fn start_search(&mut self) {
        let rate = self.tape_rate;
        self.resume = false;

        self.search = SearchState {
            majority:    0,
            seeded:      false,
            flipped:     false,
            mismatches:  0,
            matches:     0,
            ignore:      ((rate as f32) * SEARCH_IGNORE_SECS) as u32,
            tolerance:   if rate > 44_000 { 2 } else if rate > 32_000 { 1 } else { 0 },
            target:      ((rate as f32) * SEARCH_DETECT_SECS) as u32,
        };
    }

    // One fast-wind stride of the program search: classify the bit under
    // the cursor, then move, in either direction.
    pub fn search_wind(&mut self, msec: u32, direction: Direction) -> io::Result<SearchTick> {
        let steps = (self.tape_rate / 1000) * msec * FAST_WIND_MULTIPLIER;
        self.resume = false;

        let mut tape = self.tape.lock().expect(TAPE_LOCK_MSG);
        for _ in 0..steps {
            let bit = tape.cursor_mut().read();
            if self.search.classify(bit) {
                return Ok(SearchTick::Found);
            }
            let moved = match direction {
                Direction::Forward  => tape.cursor_mut().step_forward()?,
                Direction::Backward => tape.cursor_mut().step_backward()?,
            };
            if moved == Step::Boundary {
                return Ok(SearchTick::Boundary);
            }
        }

        Ok(SearchTick::Searching)
    }

    // Spin up the tape-side record writer.  Incoming chunks are handed to
    // it over a small bounded queue; nothing reaches the tape until the
    // device actually produces data.
    pub fn start_record(&mut self) {
        if self.writer.is_some() {
            warn!("The record writer is already running.");
            return;
        }
        let (feed_tx, feed_rx) = sync_channel(RECORD_QUEUE_DEPTH);

        let tape        = Arc::clone(&self.tape);
        let host_rate   = self.host_rate;
        let tape_rate   = self.tape_rate;
        let bit_convert = self.bit_convert;

        let handle = thread::spawn(move || {
            run_record_writer(tape, feed_rx, host_rate, tape_rate, bit_convert);
        });
        self.writer = Some(RecordWriter { feed_tx, handle });

        info!("Record writer started ({} strategy).",
              if bit_convert || tape_rate < 32_000 { "edge" } else { "decimation" });
    }

    // Hand a chunk of recorded host samples to the writer.  Blocks while
    // the queue is full; reports Ended once the writer hit the tape end.
    pub fn feed_record(&mut self, chunk: &[u8]) -> Feed {
        if chunk.is_empty() {
            return Feed::Accepted;
        }
        match &self.writer {
            Some(writer) => {
                match writer.feed_tx.send(chunk.to_vec()) {
                    Ok(())  => Feed::Accepted,
                    Err(_)  => Feed::Ended,
                }
            },
            None => Feed::Ended,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.writer.is_some()
    }

    // Shut the record writer down.  Closing the feed queue is the
    // cancellation signal; whatever the writer had scanned by then is
    // padded out as silence before it terminates.
    pub fn stop_record(&mut self) {
        if let Some(writer) = self.writer.take() {
            drop(writer.feed_tx);
            if writer.handle.join().is_err() {
                error!("The record writer thread panicked.");
            }
            let mut tape = self.tape.lock().expect(TAPE_LOCK_MSG);
            if let Err(err) = tape.cursor_mut().flush() {
                warn!("Failed to flush the tape after recording: {}.", err);
            }
            info!("Record writer stopped.");
        }
    }
}


// The writer's view of the inbound sample stream: a cursor over the
// current chunk, pulling the next chunk off the queue whenever the
// current one runs out.  The queue hanging up is the cancellation signal.
struct RecordFeed {
    rx:      Receiver<Vec<u8>>,
    cursor:  Option<BitCursor<MemStore>>,
}

impl RecordFeed {
    fn new(rx: Receiver<Vec<u8>>) -> RecordFeed {
        RecordFeed { rx, cursor: None }
    }
    // Block until a chunk is available; false once the feeding side hung up.
    fn await_chunk(&mut self) -> bool {
        loop {
            match self.rx.recv() {
                Ok(chunk) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    self.cursor = BitCursor::new(MemStore::new(chunk)).ok();
                    return true;
                },
                Err(_) => {
                    self.cursor = None;
                    return false;
                },
            }
        }
    }
    fn inverted_bit(&self) -> u8 {
        match &self.cursor {
            Some(cursor) => cursor.read_inverted(),
            None         => 1,
        }
    }
    // Step one host bit ahead, blocking for the next chunk at the end of
    // the current one; false once cancelled.
    fn advance(&mut self) -> bool {
        let exhausted = match self.cursor.as_mut() {
            Some(cursor) => cursor.step_forward().unwrap_or(Step::Boundary) == Step::Boundary,
            None         => true,
        };
        if exhausted {
            self.await_chunk()
        } else {
            true
        }
    }
}

enum EdgeScan {
    Found(u32),
    Cancelled(u32),
}

// Scan the inverted host stream for a rising edge, counting scanned bits.
fn search_rising_edge(feed: &mut RecordFeed) -> EdgeScan {
    let mut previous: u8  = 1;
    let mut count:    u32 = 0;

    loop {
        count += 1;
        let current = feed.inverted_bit();
        if previous == 0 && current == 1 {
            return EdgeScan::Found(count);
        }
        previous = current;
        if !feed.advance() {
            return EdgeScan::Cancelled(count);
        }
    }
}

// Lay down the canonical waveform of one decoded logical bit.
fn write_encoded_bit(tape: &Arc<Mutex<TapeImage>>, bit: u8, tape_rate: u32) -> io::Result<Step> {
    let half = (tape_rate / BIT_CLOCK_HZ) * if bit != 0 { 2 } else { 1 };
    let mut image = tape.lock().expect(TAPE_LOCK_MSG);

    let cursor = image.cursor_mut();
    for _ in 0..half {
        cursor.write(1);
        if cursor.step_forward()? == Step::Boundary {
            return Ok(Step::Boundary);
        }
    }
    for _ in 0..half {
        cursor.write(0);
        if cursor.step_forward()? == Step::Boundary {
            return Ok(Step::Boundary);
        }
    }

    Ok(Step::Moved)
}

// Pad a silent span, rescaled from the host clock to the tape clock.
fn write_blank(tape: &Arc<Mutex<TapeImage>>, host_bits: u32, host_rate: u32, tape_rate: u32)
        -> io::Result<Step> {

    let tape_bits = (host_bits as u64) * ((tape_rate / 100) as u64) / ((host_rate / 100) as u64);
    let mut image = tape.lock().expect(TAPE_LOCK_MSG);

    let cursor = image.cursor_mut();
    for _ in 0..tape_bits {
        cursor.write(0);
        if cursor.step_forward()? == Step::Boundary {
            return Ok(Step::Boundary);
        }
    }

    Ok(Step::Moved)
}

// Edge-detecting recording: hunt for the rising edge of each half-cycle,
// classify the bit by sampling 1.5 nominal periods later, and rewrite the
// canonical waveform for it.  Long edge gaps are silence and get padded
// through as such.
fn record_edges(tape: &Arc<Mutex<TapeImage>>, feed: &mut RecordFeed,
                host_rate: u32, tape_rate: u32) -> io::Result<()> {

    let nominal = host_rate / BIT_CLOCK_HZ;
    let judge = nominal + nominal / 2;
    let blank_threshold = nominal * 4;

    loop {
        let scanned = match search_rising_edge(feed) {
            EdgeScan::Found(count) => count,
            EdgeScan::Cancelled(count) => {
                // Whatever was scanned before the cut is silence.
                write_blank(tape, count, host_rate, tape_rate)?;
                return Ok(());
            },
        };
        if scanned > blank_threshold {
            if write_blank(tape, scanned, host_rate, tape_rate)? == Step::Boundary {
                return Ok(());
            }
        }
        let mut cancelled = false;
        for _ in 0..judge {
            if !feed.advance() {
                cancelled = true;
                break;
            }
        }
        if cancelled {
            return Ok(());
        }
        let bit = feed.inverted_bit();
        if write_encoded_bit(tape, bit, tape_rate)? == Step::Boundary {
            return Ok(());
        }
    }
}

// Raw recording: one tape bit per tape-bit period, its value the majority
// vote of the inverted host samples inside the period.  No reshaping.
fn record_decimated(tape: &Arc<Mutex<TapeImage>>, feed: &mut RecordFeed,
                    host_rate: u32, tape_rate: u32) -> io::Result<()> {

    let mut tape_time:  i32 = (tape_rate / 2) as i32;
    let mut high_count: u32 = 0;
    let mut bit_count:  u32 = 0;

    loop {
        // The host line arrives inverted relative to tape polarity.
        let mut vote = feed.inverted_bit();
        if vote == 1 {
            high_count += 1;
        }
        bit_count += 1;

        while tape_time > 0 {
            if high_count * 2 > bit_count {
                vote = 1;
            } else if high_count * 2 < bit_count {
                vote = 0;
            }
            // An exact tie keeps the sample as-is.
            high_count = 0;
            bit_count  = 0;

            {
                let mut image = tape.lock().expect(TAPE_LOCK_MSG);
                let cursor = image.cursor_mut();
                cursor.write(vote);
                if cursor.step_forward()? == Step::Boundary {
                    return Ok(());
                }
            }
            tape_time -= host_rate as i32;
        }
        if !feed.advance() {
            return Ok(());
        }
        tape_time += tape_rate as i32;
    }
}

fn run_record_writer(tape: Arc<Mutex<TapeImage>>, feed_rx: Receiver<Vec<u8>>,
                     host_rate: u32, tape_rate: u32, bit_convert: bool) {

    let mut feed = RecordFeed::new(feed_rx);

    // Nothing is committed to tape until the device produces data.
    if !feed.await_chunk() {
        return;
    }

    let result = if bit_convert || tape_rate < 32_000 {
        record_edges(&tape, &mut feed, host_rate, tape_rate)
    } else {
        record_decimated(&tape, &mut feed, host_rate, tape_rate)
    };
    if let Err(err) = result {
        error!("Recording failed with an I/O error: {}.", err);
    }

    let mut image = tape.lock().expect(TAPE_LOCK_MSG);
    if let Err(err) = image.cursor_mut().flush() {
        warn!("Failed to flush the tape at the end of recording: {}.", err);
    }
}
