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

use bitflags::bitflags;
use log::{info, warn, error};

use std::path;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::mpsc::{Receiver, SyncSender};
use std::thread;
use std::time::{Duration, Instant};

use crate::port::{CassettePort, PortError, Response, SampleRateClass};
use crate::port::{COM_AFF, COM_AREW, COM_EJECT, COM_FF, COM_PLAY, COM_REC,
                  COM_REW, COM_SENSOR, COM_STATUS, COM_STOP};
use crate::tape::{OpenError, TapeImage};
use crate::transport::{Direction, Feed, Fill, SearchTick, TapeTransport, Winding};
use crate::util::Sink;


// Chunk sizing on the device link:
const PLAY_CHUNK_LEN:    usize = 64;
const RECORD_BUFFER_LEN: usize = 512;

// One bounded step of a fast-wind mode covers this much tape time, and is
// followed by an equally long nap.
const WIND_TICK_MS: u32 = 10;

// Front-ends shouldn't be redrawn more often than this while a mode runs.
const SCREEN_UPDATE_MS: u64 = 90;

// An idealized tape deck still doesn't stop on a dime.
const MECHANICAL_SETTLE: Duration = Duration::from_millis(500);

// Outbound responses queue up here; a single sender thread drains them in
// order, so a burst of notifications can't fan out into a thread storm.
const RESPONSE_QUEUE_DEPTH: usize = 16;

const STATUS_LOCK_MSG:    &str = ".expect() call: The deck status lock is poisoned";
const DECK_LOCK_MSG:      &str = ".expect() call: The tape deck lock is poisoned";
const LISTENERS_LOCK_MSG: &str = ".expect() call: The listener list lock is poisoned";

bitflags! {
    pub struct Sensor: u8 {
        const RUNNING             = 0x01;
        const TAPE_SET            = 0x02;
        const NOT_WRITE_PROTECTED = 0x04;
    }
}

// The mechanism's modes; the discriminants are the values reported by the
// STATUS query.
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum DeckMode {
    None          = 0,
    Play          = 1,
    Record        = 2,
    Rewind        = 3,
    FastForward   = 4,
    SearchRewind  = 5,
    SearchForward = 6,
    Stop          = 7,
    Eject         = 8,
}

// What registered listeners get to hear about.
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum DeckEvent {
    TapeEjected,
    ScreenUpdate,
    DeviceDisconnected,
    DeviceError,
}

struct Status {
    mode:    DeckMode,
    sensor:  Sensor,
}

// State reachable from the service threads.  The status and the deck are
// only ever mutated by the dispatcher and the single active worker.
struct Shared {
    status:         Mutex<Status>,
    deck:           Mutex<Option<TapeTransport>>,
    listeners:      Mutex<Vec<Box<dyn Sink<DeckEvent> + Send>>>,
    worker_run:     AtomicBool,
    receiver_run:   AtomicBool,
    device_failed:  AtomicBool,
    alt_44k:        AtomicBool,
    bit_convert:    AtomicBool,
}

impl Shared {
    fn notify(&self, event: DeckEvent) {
        let mut listeners = self.listeners.lock().expect(LISTENERS_LOCK_MSG);
        for listener in listeners.iter_mut() {
            listener.push(event);
        }
    }
}

enum DispatchMsg {
    Command(u8),
    EjectRequest,
    Shutdown,
}

fn derive_rate_class(tape_rate: u32, use_alt_44k: bool) -> SampleRateClass {
    match tape_rate {
        44_100 | 22_050 => {
            if use_alt_44k {
                SampleRateClass::R44100Alt
            } else {
                SampleRateClass::R44100
            }
        },
        32_000 | 16_000 => SampleRateClass::R32000,
        _               => SampleRateClass::R48000,
    }
}

// The data recorder: a command-driven state machine around the tape
// transport, talking to the device through a CassettePort and to the
// front-end through queries and DeckEvent listeners.
//
// power_on() starts three service threads: a command receiver blocking on
// the device, a dispatcher executing commands off a channel, and a
// responder draining the outbound response queue.  Active modes run on a
// fourth, per-mode worker thread; the dispatcher guarantees at most one
// of those is ever alive.
pub struct DataRecorder {
    shared:       Arc<Shared>,
    port:         Arc<dyn CassettePort>,
    command_tx:   mpsc::Sender<DispatchMsg>,
    command_rx:   Option<Receiver<DispatchMsg>>,
    response_tx:  Option<SyncSender<(Response, u8)>>,
    response_rx:  Option<Receiver<(Response, u8)>>,
    dispatcher:   Option<thread::JoinHandle<()>>,
    receiver:     Option<thread::JoinHandle<()>>,
    responder:    Option<thread::JoinHandle<()>>,
}

impl DataRecorder {
    pub fn new(port: Arc<dyn CassettePort>) -> DataRecorder {
        let (command_tx, command_rx)   = mpsc::channel();
        let (response_tx, response_rx) = mpsc::sync_channel(RESPONSE_QUEUE_DEPTH);

        let shared = Arc::new(Shared {
            status:         Mutex::new(Status {
                                mode:   DeckMode::Eject,
                                sensor: Sensor::empty(),
                            }),
            deck:           Mutex::new(None),
            listeners:      Mutex::new(Vec::new()),
            worker_run:     AtomicBool::new(false),
            receiver_run:   AtomicBool::new(false),
            device_failed:  AtomicBool::new(false),
            alt_44k:        AtomicBool::new(false),
            bit_convert:    AtomicBool::new(false),
        });

        info!("Created the data recorder.");
        DataRecorder {
            shared,
            port,
            command_tx,
            command_rx:   Some(command_rx),
            response_tx:  Some(response_tx),
            response_rx:  Some(response_rx),
            dispatcher:   None,
            receiver:     None,
            responder:    None,
        }
    }

    pub fn power_on(&mut self) {
        if self.dispatcher.is_some() {
            warn!("The data recorder is already powered on.");
            return;
        }
        let command_rx = match self.command_rx.take() {
            Some(rx) => rx,
            None => {
                error!("The data recorder cannot be powered back on after power-off.");
                return;
            },
        };
        let response_rx = match self.response_rx.take() {
            Some(rx) => rx,
            None => { return; },
        };
        let response_tx = match &self.response_tx {
            Some(tx) => tx.clone(),
            None     => { return; },
        };

        {
            let shared = Arc::clone(&self.shared);
            let port   = Arc::clone(&self.port);
            self.responder = Some(thread::spawn(move || {
                responder_thread(shared, port, response_rx);
            }));
        }
        {
            self.shared.receiver_run.store(true, Ordering::SeqCst);
            let shared = Arc::clone(&self.shared);
            let port   = Arc::clone(&self.port);
            let tx     = self.command_tx.clone();
            self.receiver = Some(thread::spawn(move || {
                receive_thread(shared, port, tx);
            }));
        }
        {
            let dispatcher = Dispatcher {
                shared:       Arc::clone(&self.shared),
                port:         Arc::clone(&self.port),
                response_tx,
                worker:       None,
            };
            self.dispatcher = Some(thread::spawn(move || {
                dispatcher.run(command_rx);
            }));
        }

        info!("The data recorder is powered on.");
    }

    pub fn power_off(&mut self) {
        let was_on = self.dispatcher.is_some();

        if let Some(handle) = self.dispatcher.take() {
            let _ = self.command_tx.send(DispatchMsg::Shutdown);
            if handle.join().is_err() {
                error!("The command dispatch thread panicked.");
            }
        }
        self.shared.receiver_run.store(false, Ordering::SeqCst);
        if let Some(handle) = self.receiver.take() {
            while !handle.is_finished() {
                self.port.cancel();
                thread::sleep(Duration::from_millis(5));
            }
            let _ = handle.join();
        }
        // Closing the queue lets the responder drain out and stop.
        self.response_tx = None;
        if let Some(handle) = self.responder.take() {
            let _ = handle.join();
        }

        if was_on {
            info!("The data recorder is powered off.");
        }
    }

    // Load a tape image and bring the deck into STOP.  The device is told
    // which clock class to run the line at, derived from the tape's
    // sample rate.
    pub fn set_tape<P: AsRef<path::Path>>(&mut self, file_path: P) -> Result<(), OpenError> {
        let image = TapeImage::open(file_path)?;
        let protected = image.is_write_protected();

        let mut transport = TapeTransport::new(image);
        transport.set_bit_conversion(self.shared.bit_convert.load(Ordering::SeqCst));
        let class = derive_rate_class(transport.tape_rate(),
                                      self.shared.alt_44k.load(Ordering::SeqCst));
        transport.set_host_rate(class.host_rate());

        {
            let mut deck = self.shared.deck.lock().expect(DECK_LOCK_MSG);
            if let Some(previous) = deck.take() {
                previous.close();
            }
            *deck = Some(transport);
        }
        let sensor = {
            let mut status = self.shared.status.lock().expect(STATUS_LOCK_MSG);
            status.sensor = Sensor::TAPE_SET;
            if !protected {
                status.sensor.insert(Sensor::NOT_WRITE_PROTECTED);
            }
            status.mode = DeckMode::Stop;
            status.sensor
        };

        self.respond(Response::SampleRateChange, class as u8);
        self.respond(Response::SensorChange, 0x80 | sensor.bits());
        Ok(())
    }

    // Eject on behalf of the front-end; the front-end initiated it, so no
    // eject event comes back.
    pub fn eject_tape(&self) {
        let _ = self.command_tx.send(DispatchMsg::EjectRequest);
    }

    // Hand a command byte to the dispatcher, exactly as if the device had
    // sent it.
    pub fn command(&self, byte: u8) {
        let _ = self.command_tx.send(DispatchMsg::Command(byte));
    }

    pub fn add_listener(&self, listener: Box<dyn Sink<DeckEvent> + Send>) {
        self.shared.listeners.lock().expect(LISTENERS_LOCK_MSG).push(listener);
    }

    pub fn current_mode(&self) -> DeckMode {
        self.shared.status.lock().expect(STATUS_LOCK_MSG).mode
    }
    pub fn sensor(&self) -> Sensor {
        self.shared.status.lock().expect(STATUS_LOCK_MSG).sensor
    }
    pub fn is_running(&self) -> bool {
        self.shared.worker_run.load(Ordering::SeqCst)
    }
    pub fn tape_sample_rate(&self) -> u32 {
        let deck = self.shared.deck.lock().expect(DECK_LOCK_MSG);
        deck.as_ref().map(|transport| transport.tape_rate()).unwrap_or(0)
    }
    pub fn tape_name(&self) -> Option<String> {
        let deck = self.shared.deck.lock().expect(DECK_LOCK_MSG);
        deck.as_ref().map(|transport| transport.name())
    }
    // The tape counter, in bit positions.
    pub fn counter(&self) -> u32 {
        let deck = self.shared.deck.lock().expect(DECK_LOCK_MSG);
        deck.as_ref().map(|transport| transport.bit_pos()).unwrap_or(0)
    }
    pub fn total_counter(&self) -> u32 {
        let deck = self.shared.deck.lock().expect(DECK_LOCK_MSG);
        deck.as_ref().map(|transport| transport.total_bits()).unwrap_or(0)
    }

    // Some bridge boards want the other 44.1kHz divider setup; re-derive
    // and re-announce the clock class if a tape is loaded.
    pub fn set_alt_44k(&self, use_alt_44k: bool) {
        self.shared.alt_44k.store(use_alt_44k, Ordering::SeqCst);

        let class = {
            let mut deck = self.shared.deck.lock().expect(DECK_LOCK_MSG);
            match deck.as_mut() {
                Some(transport) => {
                    let class = derive_rate_class(transport.tape_rate(), use_alt_44k);
                    transport.set_host_rate(class.host_rate());
                    Some(class)
                },
                None => None,
            }
        };
        if let Some(class) = class {
            self.respond(Response::SampleRateChange, class as u8);
        }
    }

    // Choose between the edge-detecting and the raw recording strategy;
    // takes effect when the next recording starts.
    pub fn set_rec_bit_conversion(&self, enabled: bool) {
        self.shared.bit_convert.store(enabled, Ordering::SeqCst);

        let mut deck = self.shared.deck.lock().expect(DECK_LOCK_MSG);
        if let Some(transport) = deck.as_mut() {
            transport.set_bit_conversion(enabled);
        }
    }

    fn respond(&self, kind: Response, value: u8) {
        if let Some(tx) = &self.response_tx {
            let _ = tx.send((kind, value));
        }
    }
}

impl Drop for DataRecorder {
    fn drop(&mut self) {
        self.power_off();
    }
}


// Blocks on the device until a command byte shows up, then forwards it to
// the dispatcher.
fn receive_thread(shared: Arc<Shared>, port: Arc<dyn CassettePort>,
                  command_tx: mpsc::Sender<DispatchMsg>) {

    info!("Command receive thread started.");
    while shared.receiver_run.load(Ordering::SeqCst) {
        match port.receive_command() {
            Ok(byte) => {
                if command_tx.send(DispatchMsg::Command(byte)).is_err() {
                    break;
                }
            },
            Err(PortError::Cancelled) => {
                // Re-check the run flag and go back to waiting.
            },
            Err(PortError::Disconnected) => {
                error!("The device is disconnected, command reception is over.");
                shared.device_failed.store(true, Ordering::SeqCst);
                shared.notify(DeckEvent::DeviceDisconnected);
                break;
            },
            Err(PortError::Transfer(reason)) => {
                error!("Receiving a command failed: {}.", reason);
                shared.device_failed.store(true, Ordering::SeqCst);
                shared.notify(DeckEvent::DeviceError);
                break;
            },
        }
    }
    info!("Command receive thread stopped.");
}

// Drains the outbound response queue in order.  Once the device has
// failed, responses are still drained, just not delivered.
fn responder_thread(shared: Arc<Shared>, port: Arc<dyn CassettePort>,
                    response_rx: Receiver<(Response, u8)>) {

    info!("Response sender thread started.");
    for (kind, value) in response_rx.iter() {
        if shared.device_failed.load(Ordering::SeqCst) {
            continue;
        }
        match port.send_response(kind, value) {
            Ok(()) => { },
            Err(PortError::Cancelled) => { },
            Err(PortError::Disconnected) => {
                error!("The device is disconnected, dropping responses.");
                shared.device_failed.store(true, Ordering::SeqCst);
                shared.notify(DeckEvent::DeviceDisconnected);
            },
            Err(PortError::Transfer(reason)) => {
                error!("Sending a response failed: {}.", reason);
                shared.device_failed.store(true, Ordering::SeqCst);
                shared.notify(DeckEvent::DeviceError);
            },
        }
    }
    info!("Response sender thread stopped.");
}

// The dispatcher owns the worker handle; workers are spawned and joined
// here only, which is what keeps the one-worker invariant simple.
struct Dispatcher {
    shared:       Arc<Shared>,
    port:         Arc<dyn CassettePort>,
    response_tx:  SyncSender<(Response, u8)>,
    worker:       Option<thread::JoinHandle<()>>,
}

impl Dispatcher {
    fn run(mut self, command_rx: Receiver<DispatchMsg>) {
        info!("Command dispatch thread started.");
        loop {
            match command_rx.recv() {
                Ok(DispatchMsg::Command(byte)) => {
                    self.dispatch(byte);
                },
                Ok(DispatchMsg::EjectRequest) => {
                    self.stop_worker();
                    self.shared.status.lock().expect(STATUS_LOCK_MSG).mode = DeckMode::Eject;
                    self.execute_eject(false);
                },
                Ok(DispatchMsg::Shutdown) | Err(_) => {
                    break;
                },
            }
        }
        // Nothing may keep moving once the dispatcher is gone.
        self.stop_worker();
        self.execute_eject(false);
        info!("Command dispatch thread stopped.");
    }

    fn dispatch(&mut self, byte: u8) {
        match byte {
            // The queries never disturb the mechanism.
            COM_STATUS => {
                let mode = self.shared.status.lock().expect(STATUS_LOCK_MSG).mode;
                self.respond(Response::StatusChange, mode as u8);
            },
            COM_SENSOR => {
                self.send_sensor();
            },
            COM_EJECT | COM_STOP | COM_PLAY | COM_FF | COM_REW
                      | COM_AFF  | COM_AREW | COM_REC => {
                self.execute_mode_command(byte);
            },
            _ => {
                warn!("Ignoring an unknown command byte: 0x{:02X}.", byte);
            },
        }
    }

    fn execute_mode_command(&mut self, byte: u8) {
        let target = match byte {
            COM_PLAY  => DeckMode::Play,
            COM_STOP  => DeckMode::Stop,
            COM_REW   => DeckMode::Rewind,
            COM_FF    => DeckMode::FastForward,
            COM_AREW  => DeckMode::SearchRewind,
            COM_AFF   => DeckMode::SearchForward,
            COM_REC   => DeckMode::Record,
            COM_EJECT => DeckMode::Eject,
            _         => { return; },
        };
        let previous = self.shared.status.lock().expect(STATUS_LOCK_MSG).mode;

        // Changing the motion stops the mechanism first; at most one
        // worker ever runs.
        if target == DeckMode::Stop
               || (previous != DeckMode::Stop
                   && previous != DeckMode::Eject
                   && previous != target) {
            self.stop_worker();
        }

        match target {
            DeckMode::Eject => {
                self.shared.status.lock().expect(STATUS_LOCK_MSG).mode = DeckMode::Eject;
                self.execute_eject(true);
            },
            DeckMode::Stop => {
                let mut status = self.shared.status.lock().expect(STATUS_LOCK_MSG);
                status.sensor.remove(Sensor::RUNNING);
                status.mode = DeckMode::Stop;
            },
            _ => {
                {
                    let mut status = self.shared.status.lock().expect(STATUS_LOCK_MSG);
                    status.sensor.insert(Sensor::RUNNING);
                    status.mode = target;
                }
                match target {
                    DeckMode::SearchRewind | DeckMode::SearchForward => {
                        let mut deck = self.shared.deck.lock().expect(DECK_LOCK_MSG);
                        if let Some(transport) = deck.as_mut() {
                            transport.start_search();
                        }
                    },
                    DeckMode::Record => {
                        // Repeated REC commands must not restart the
                        // writer.
                        if previous != DeckMode::Record {
                            let mut deck = self.shared.deck.lock().expect(DECK_LOCK_MSG);
                            if let Some(transport) = deck.as_mut() {
                                transport.set_bit_conversion(
                                    self.shared.bit_convert.load(Ordering::SeqCst));
                                transport.start_record();
                            }
                        }
                    },
                    _ => { },
                }
            },
        }

        self.spawn_worker_if_needed();
        self.send_sensor();
        self.shared.notify(DeckEvent::ScreenUpdate);

        // The search modes acknowledge only through their eventual stop.
        if byte != COM_AFF && byte != COM_AREW {
            self.respond(Response::Request, byte);
        }
    }

    fn spawn_worker_if_needed(&mut self) {
        let (mode, should_spawn) = {
            let status = self.shared.status.lock().expect(STATUS_LOCK_MSG);
            let should = !self.shared.worker_run.load(Ordering::SeqCst)
                         && status.sensor.contains(Sensor::RUNNING | Sensor::TAPE_SET);
            (status.mode, should)
        };
        if !should_spawn {
            return;
        }
        self.shared.worker_run.store(true, Ordering::SeqCst);

        // A naturally-stopped worker parks its handle here until now.
        if let Some(stale) = self.worker.take() {
            let _ = stale.join();
        }
        let context = WorkerContext {
            shared:       Arc::clone(&self.shared),
            port:         Arc::clone(&self.port),
            response_tx:  self.response_tx.clone(),
        };
        self.worker = Some(thread::spawn(move || {
            run_mode_worker(context);
        }));
        info!("Tape worker started in {:?} mode.", mode);
    }

    fn stop_worker(&mut self) {
        self.shared.worker_run.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            // The worker may sit in a blocking transfer; keep poking the
            // port until it lets go.
            while !handle.is_finished() {
                self.port.cancel();
                thread::sleep(Duration::from_millis(5));
            }
            if handle.join().is_err() {
                error!("The tape worker thread panicked.");
            }
        }
        // The record writer must not outlive its mode.
        let mut deck = self.shared.deck.lock().expect(DECK_LOCK_MSG);
        if let Some(transport) = deck.as_mut() {
            transport.stop_record();
        }
    }

    fn execute_eject(&mut self, raise_event: bool) {
        {
            let mut deck = self.shared.deck.lock().expect(DECK_LOCK_MSG);
            if let Some(transport) = deck.take() {
                transport.close();
                info!("Tape ejected.");
            }
        }
        self.shared.status.lock().expect(STATUS_LOCK_MSG).sensor = Sensor::empty();
        self.send_sensor();
        if raise_event {
            self.shared.notify(DeckEvent::TapeEjected);
        }
    }

    fn send_sensor(&self) {
        let sensor = self.shared.status.lock().expect(STATUS_LOCK_MSG).sensor;
        self.respond(Response::SensorChange, 0x80 | sensor.bits());
    }

    fn respond(&self, kind: Response, value: u8) {
        if self.response_tx.send((kind, value)).is_err() {
            warn!("The response queue is closed, dropping a {:?} response.", kind);
        }
    }
}


// Everything a mode worker needs, bundled explicitly.
struct WorkerContext {
    shared:       Arc<Shared>,
    port:         Arc<dyn CassettePort>,
    response_tx:  SyncSender<(Response, u8)>,
}

enum WorkerStep {
    Continue,
    EndOfTape,
    Cancelled,
    DeviceError(String),
    Disconnected,
}

fn port_outcome(error: PortError) -> WorkerStep {
    match error {
        PortError::Cancelled        => WorkerStep::Cancelled,
        PortError::Disconnected     => WorkerStep::Disconnected,
        PortError::Transfer(reason) => WorkerStep::DeviceError(reason),
    }
}

// The per-mode worker loop: one bounded step per iteration, until the
// tape runs out or the dispatcher pulls the run flag.
fn run_mode_worker(context: WorkerContext) {
    let WorkerContext { shared, port, response_tx } = context;

    let mut play_chunk    = [0; PLAY_CHUNK_LEN];
    let mut record_buffer = [0; RECORD_BUFFER_LEN];
    let mut last_update   = Instant::now();
    let mut end_of_tape   = false;

    while shared.worker_run.load(Ordering::SeqCst) {
        if shared.device_failed.load(Ordering::SeqCst) {
            shared.worker_run.store(false, Ordering::SeqCst);
            break;
        }
        let mode = shared.status.lock().expect(STATUS_LOCK_MSG).mode;
        let step = match mode {
            DeckMode::Play          => step_play(&shared, &*port, &mut play_chunk),
            DeckMode::Record        => step_record(&shared, &*port, &mut record_buffer),
            DeckMode::Rewind        => step_wind(&shared, Direction::Backward),
            DeckMode::FastForward   => step_wind(&shared, Direction::Forward),
            DeckMode::SearchRewind  => step_search(&shared, Direction::Backward),
            DeckMode::SearchForward => step_search(&shared, Direction::Forward),
            _ => {
                warn!("The tape worker has nothing to do in {:?} mode.", mode);
                break;
            },
        };

        match step {
            WorkerStep::Continue => { },
            WorkerStep::Cancelled => {
                // A stop is on its way; don't spin while it settles in.
                if shared.worker_run.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(1));
                }
            },
            WorkerStep::EndOfTape => {
                shared.worker_run.store(false, Ordering::SeqCst);
                end_of_tape = true;
            },
            WorkerStep::DeviceError(reason) => {
                error!("Device transfer failed: {}.", reason);
                shared.device_failed.store(true, Ordering::SeqCst);
                shared.worker_run.store(false, Ordering::SeqCst);
                shared.notify(DeckEvent::DeviceError);
            },
            WorkerStep::Disconnected => {
                error!("The device is disconnected.");
                shared.device_failed.store(true, Ordering::SeqCst);
                shared.worker_run.store(false, Ordering::SeqCst);
                shared.notify(DeckEvent::DeviceDisconnected);
            },
        }

        if last_update.elapsed() >= Duration::from_millis(SCREEN_UPDATE_MS) {
            last_update = Instant::now();
            shared.notify(DeckEvent::ScreenUpdate);
        }
    }

    // The mechanism coasts into STOP no matter why the loop ended.
    {
        let mut status = shared.status.lock().expect(STATUS_LOCK_MSG);
        status.sensor.remove(Sensor::RUNNING);
        status.mode = DeckMode::Stop;
    }
    thread::sleep(MECHANICAL_SETTLE);

    if end_of_tape {
        let sensor = shared.status.lock().expect(STATUS_LOCK_MSG).sensor;
        let _ = response_tx.send((Response::SensorChange, 0x80 | sensor.bits()));
        let _ = response_tx.send((Response::Request, COM_STOP));
    }
    shared.notify(DeckEvent::ScreenUpdate);
}

fn step_play(shared: &Shared, port: &dyn CassettePort,
             chunk: &mut [u8; PLAY_CHUNK_LEN]) -> WorkerStep {

    let fill = {
        let mut deck = shared.deck.lock().expect(DECK_LOCK_MSG);
        match deck.as_mut() {
            Some(transport) => transport.fill_chunk(&mut chunk[..]),
            None            => { return WorkerStep::EndOfTape; },
        }
    };
    match fill {
        Ok(Fill::Complete) => {
            match port.send_chunk(&chunk[..]) {
                Ok(())     => WorkerStep::Continue,
                Err(error) => port_outcome(error),
            }
        },
        Ok(Fill::EndOfTape(length)) => {
            if length > 0 {
                if let Err(error) = port.send_chunk(&chunk[..length]) {
                    return port_outcome(error);
                }
            }
            WorkerStep::EndOfTape
        },
        Err(error) => {
            error!("Reading the tape failed: {}.", error);
            WorkerStep::EndOfTape
        },
    }
}

fn step_record(shared: &Shared, port: &dyn CassettePort,
               buffer: &mut [u8; RECORD_BUFFER_LEN]) -> WorkerStep {

    match port.receive_chunk(&mut buffer[..]) {
        Ok(length) => {
            let mut deck = shared.deck.lock().expect(DECK_LOCK_MSG);
            match deck.as_mut() {
                Some(transport) => {
                    match transport.feed_record(&buffer[..length]) {
                        Feed::Accepted => WorkerStep::Continue,
                        Feed::Ended    => WorkerStep::EndOfTape,
                    }
                },
                None => WorkerStep::EndOfTape,
            }
        },
        Err(error) => port_outcome(error),
    }
}

fn step_wind(shared: &Shared, direction: Direction) -> WorkerStep {
    let outcome = {
        let mut deck = shared.deck.lock().expect(DECK_LOCK_MSG);
        match deck.as_mut() {
            Some(transport) => transport.wind(WIND_TICK_MS, direction),
            None            => { return WorkerStep::EndOfTape; },
        }
    };
    match outcome {
        Ok(Winding::Moved) => {
            thread::sleep(Duration::from_millis(WIND_TICK_MS as u64));
            WorkerStep::Continue
        },
        Ok(Winding::Boundary) => WorkerStep::EndOfTape,
        Err(error) => {
            error!("Winding the tape failed: {}.", error);
            WorkerStep::EndOfTape
        },
    }
}

fn step_search(shared: &Shared, direction: Direction) -> WorkerStep {
    let outcome = {
        let mut deck = shared.deck.lock().expect(DECK_LOCK_MSG);
        match deck.as_mut() {
            Some(transport) => transport.search_wind(WIND_TICK_MS, direction),
            None            => { return WorkerStep::EndOfTape; },
        }
    };
    match outcome {
        Ok(SearchTick::Searching) => {
            thread::sleep(Duration::from_millis(WIND_TICK_MS as u64));
            WorkerStep::Continue
        },
        Ok(SearchTick::Found) => {
            let position = shared.deck.lock().expect(DECK_LOCK_MSG)
                               .as_ref()
                               .map(|transport| transport.bit_pos())
                               .unwrap_or(0);
            info!("Program boundary found at bit position {}.", position);
            WorkerStep::EndOfTape
        },
        Ok(SearchTick::Boundary) => WorkerStep::EndOfTape,
        Err(error) => {
            error!("Searching the tape failed: {}.", error);
            WorkerStep::EndOfTape
        },
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::io::Write as _;
    use std::sync::Condvar;

    struct PortInner {
        cancelled:    bool,
        record_feed:  VecDeque<Vec<u8>>,
    }

    // A device stand-in: blocking waits parked on a condvar, everything
    // sent by the recorder collected for inspection.
    struct TestPort {
        inner:       Mutex<PortInner>,
        condvar:     Condvar,
        responses:   Mutex<Vec<(Response, u8)>>,
        sent:        Mutex<Vec<Vec<u8>>>,
        fail_sends:  AtomicBool,
        play_delay:  Duration,
    }

    impl TestPort {
        fn new() -> Arc<TestPort> {
            TestPort::with_play_delay(Duration::from_millis(0))
        }
        fn with_play_delay(play_delay: Duration) -> Arc<TestPort> {
            Arc::new(TestPort {
                inner: Mutex::new(PortInner {
                    cancelled:    false,
                    record_feed:  VecDeque::new(),
                }),
                condvar:     Condvar::new(),
                responses:   Mutex::new(Vec::new()),
                sent:        Mutex::new(Vec::new()),
                fail_sends:  AtomicBool::new(false),
                play_delay,
            })
        }
        fn count_response(&self, kind: Response, value: u8) -> usize {
            self.responses.lock().unwrap()
                .iter()
                .filter(|&&entry| entry == (kind, value))
                .count()
        }
        fn sent_chunks(&self) -> Vec<Vec<u8>> {
            self.sent.lock().unwrap().clone()
        }
        fn push_record_chunk(&self, data: Vec<u8>) {
            self.inner.lock().unwrap().record_feed.push_back(data);
            self.condvar.notify_all();
        }
    }

    impl CassettePort for TestPort {
        fn receive_command(&self) -> Result<u8, PortError> {
            let mut inner = self.inner.lock().unwrap();
            loop {
                if inner.cancelled {
                    inner.cancelled = false;
                    return Err(PortError::Cancelled);
                }
                inner = self.condvar.wait(inner).unwrap();
            }
        }
        fn send_response(&self, kind: Response, value: u8) -> Result<(), PortError> {
            self.responses.lock().unwrap().push((kind, value));
            Ok(())
        }
        fn send_chunk(&self, chunk: &[u8]) -> Result<(), PortError> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(PortError::Transfer("induced failure".to_owned()));
            }
            if self.play_delay > Duration::from_millis(0) {
                thread::sleep(self.play_delay);
            }
            self.sent.lock().unwrap().push(chunk.to_vec());
            Ok(())
        }
        fn receive_chunk(&self, buffer: &mut [u8]) -> Result<usize, PortError> {
            let mut inner = self.inner.lock().unwrap();
            loop {
                if let Some(data) = inner.record_feed.pop_front() {
                    let length = data.len().min(buffer.len());
                    buffer[..length].copy_from_slice(&data[..length]);
                    return Ok(length);
                }
                if inner.cancelled {
                    inner.cancelled = false;
                    return Err(PortError::Cancelled);
                }
                inner = self.condvar.wait(inner).unwrap();
            }
        }
        fn cancel(&self) {
            self.inner.lock().unwrap().cancelled = true;
            self.condvar.notify_all();
        }
    }

    fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            if Instant::now() > deadline {
                panic!("timed out waiting for {}", what);
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn legacy_tape_file(rate: u32, data: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&rate.to_le_bytes()).unwrap();
        file.write_all(data).unwrap();
        file.flush().unwrap();
        file
    }

    fn recorder_with_tape(port: &Arc<TestPort>, rate: u32, data: &[u8])
            -> (DataRecorder, tempfile::NamedTempFile) {

        let mut recorder = DataRecorder::new(Arc::clone(port) as Arc<dyn CassettePort>);
        recorder.power_on();
        let file = legacy_tape_file(rate, data);
        recorder.set_tape(file.path()).unwrap();
        (recorder, file)
    }

    #[test]
    fn inserting_a_tape_reports_the_sensor_and_the_clock_class() {
        let port = TestPort::new();
        let (recorder, _file) = recorder_with_tape(&port, 44_100, &[0; 64]);

        assert_eq!(recorder.current_mode(), DeckMode::Stop);
        assert_eq!(recorder.sensor(), Sensor::TAPE_SET | Sensor::NOT_WRITE_PROTECTED);
        assert_eq!(recorder.tape_sample_rate(), 44_100);
        assert_eq!(recorder.total_counter(), 64 * 8);

        wait_until("the insert responses", || {
            port.count_response(Response::SampleRateChange, SampleRateClass::R44100 as u8) == 1
                && port.count_response(Response::SensorChange, 0x86) >= 1
        });

        // The alternate 44.1kHz class is re-announced on request.
        recorder.set_alt_44k(true);
        wait_until("the alternate clock class", || {
            port.count_response(Response::SampleRateChange, SampleRateClass::R44100Alt as u8) == 1
        });
    }

    #[test]
    fn playback_runs_to_the_end_of_the_tape() {
        let data: Vec<u8> = (0..16).map(|value| value * 3).collect();
        let port = TestPort::new();
        let (recorder, _file) = recorder_with_tape(&port, 48_000, &data);

        recorder.command(COM_PLAY);

        wait_until("the playback to finish", || !recorder.is_running()
                                                && port.count_response(Response::Request, COM_STOP) == 1);

        // Equal tape and host rates make playback a passthrough.
        let chunks = port.sent_chunks();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], data);

        assert_eq!(port.count_response(Response::Request, COM_PLAY), 1);
        assert_eq!(recorder.current_mode(), DeckMode::Stop);
        assert!(!recorder.sensor().contains(Sensor::RUNNING));
        assert!(recorder.sensor().contains(Sensor::TAPE_SET));
    }

    #[test]
    fn record_then_stop_with_no_input_writes_nothing() {
        // A legacy 8000-byte image: 4 header bytes plus 7996 data bytes.
        let data = vec![0x5A; 7996];
        let port = TestPort::new();
        let (recorder, file) = recorder_with_tape(&port, 32_000, &data);

        assert_eq!(recorder.total_counter(), 7996 * 8);

        recorder.command(COM_REC);
        wait_until("the recording to start", || recorder.is_running());
        assert_eq!(recorder.current_mode(), DeckMode::Record);

        recorder.command(COM_STOP);
        wait_until("the deck to stop", || !recorder.is_running()
                                          && port.count_response(Response::Request, COM_STOP) == 1);

        assert_eq!(recorder.current_mode(), DeckMode::Stop);
        assert_eq!(recorder.counter(), 0);
        assert_eq!(port.count_response(Response::Request, COM_REC), 1);

        // Not a single bit reached the image.
        let contents = std::fs::read(file.path()).unwrap();
        assert_eq!(&contents[4..], &data[..]);
    }

    #[test]
    fn recording_passes_chunks_through_to_the_tape() {
        let port = TestPort::new();
        let (recorder, file) = recorder_with_tape(&port, 48_000, &[0x00; 8]);

        recorder.command(COM_REC);
        wait_until("the recording to start", || recorder.is_running());

        port.push_record_chunk(vec![0x0F, 0xF0]);
        wait_until("the chunk to reach the tape", || recorder.counter() == 16);

        recorder.command(COM_STOP);
        wait_until("the deck to stop", || !recorder.is_running());

        // The decimating strategy stores the inverted host stream 1:1.
        let contents = std::fs::read(file.path()).unwrap();
        assert_eq!(&contents[4..6], &[0xF0, 0x0F]);
    }

    #[test]
    fn queries_answer_without_disturbing_the_mode() {
        let port = TestPort::new();
        let (recorder, _file) = recorder_with_tape(&port, 48_000, &[0; 32]);

        recorder.command(COM_STATUS);
        wait_until("the status response", || {
            port.count_response(Response::StatusChange, DeckMode::Stop as u8) == 1
        });

        // Let the insert-time sensor notification land first.
        wait_until("the insert sensor response", || {
            port.count_response(Response::SensorChange, 0x86) >= 1
        });
        let baseline = port.count_response(Response::SensorChange, 0x86);
        recorder.command(COM_SENSOR);
        wait_until("the sensor response", || {
            port.count_response(Response::SensorChange, 0x86) == baseline + 1
        });

        assert_eq!(recorder.current_mode(), DeckMode::Stop);
        assert!(!recorder.is_running());
    }

    #[test]
    fn unknown_commands_are_ignored() {
        let port = TestPort::new();
        let (recorder, _file) = recorder_with_tape(&port, 48_000, &[0; 32]);

        recorder.command(0x7F);
        recorder.command(COM_STATUS);
        wait_until("the status response", || {
            port.count_response(Response::StatusChange, DeckMode::Stop as u8) == 1
        });
        assert_eq!(recorder.current_mode(), DeckMode::Stop);
    }

    #[test]
    fn eject_clears_the_deck_and_raises_the_event() {
        let port = TestPort::new();
        let (recorder, _file) = recorder_with_tape(&port, 48_000, &[0; 32]);

        let (event_tx, event_rx) = mpsc::channel();
        recorder.add_listener(Box::new(event_tx));

        recorder.command(COM_EJECT);
        wait_until("the eject to finish", || recorder.current_mode() == DeckMode::Eject);

        wait_until("the eject event", || {
            event_rx.try_iter().any(|event| event == DeckEvent::TapeEjected)
        });
        assert_eq!(recorder.sensor(), Sensor::empty());
        assert_eq!(recorder.tape_sample_rate(), 0);
        assert_eq!(port.count_response(Response::Request, COM_EJECT), 1);
    }

    #[test]
    fn fast_forward_stops_at_the_tape_end() {
        let port = TestPort::new();
        let (recorder, _file) = recorder_with_tape(&port, 8_000, &[0; 100]);

        recorder.command(COM_FF);
        wait_until("the wind to finish", || !recorder.is_running()
                                            && port.count_response(Response::Request, COM_STOP) == 1);

        // Parked on the very last bit position.
        assert_eq!(recorder.counter(), recorder.total_counter() - 1);
        assert_eq!(recorder.current_mode(), DeckMode::Stop);
        assert_eq!(port.count_response(Response::Request, COM_FF), 1);
    }

    #[test]
    fn mode_changes_stop_the_previous_worker_first() {
        let port = TestPort::with_play_delay(Duration::from_millis(2));
        let (recorder, _file) = recorder_with_tape(&port, 48_000, &vec![0xA5; 100_000]);

        recorder.command(COM_PLAY);
        wait_until("the playback to start", || recorder.is_running()
                                               && port.sent_chunks().len() >= 2);

        // Switching to rewind stops the playback worker first; the rewind
        // then runs back into the tape start boundary on its own.
        recorder.command(COM_REW);
        wait_until("the rewind to hit the start", || {
            port.count_response(Response::Request, COM_STOP) == 1 && !recorder.is_running()
        });

        assert_eq!(recorder.current_mode(), DeckMode::Stop);
        assert_eq!(recorder.counter(), 0);
        assert_eq!(port.count_response(Response::Request, COM_PLAY), 1);
        assert_eq!(port.count_response(Response::Request, COM_REW), 1);
        assert_eq!(port.count_response(Response::Request, COM_STOP), 1);
    }

    #[test]
    fn device_errors_degrade_to_stop() {
        let port = TestPort::new();
        let (recorder, _file) = recorder_with_tape(&port, 48_000, &[0; 64]);

        let (event_tx, event_rx) = mpsc::channel();
        recorder.add_listener(Box::new(event_tx));

        port.fail_sends.store(true, Ordering::SeqCst);
        recorder.command(COM_PLAY);

        wait_until("the device error", || {
            event_rx.try_iter().any(|event| event == DeckEvent::DeviceError)
        });
        wait_until("the degrade to STOP", || !recorder.is_running()
                                             && recorder.current_mode() == DeckMode::Stop);

        // A failed deck never claims a clean end-of-tape stop.
        assert_eq!(port.count_response(Response::Request, COM_STOP), 0);
    }
}
