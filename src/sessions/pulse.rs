//! PulseAudio-backed session directory.
//!
//! One directory instance owns one connection to the sound server and makes
//! strictly synchronous round trips on it: each request drives the mainloop
//! until its operation completes. Instances are not thread-safe - give
//! every caller its own directory, or serialize calls externally.

use std::cell::{Cell, RefCell};
use std::ops::Deref;
use std::rc::Rc;

use libpulse_binding::callbacks::ListResult;
use libpulse_binding::context::{Context, FlagSet, State};
use libpulse_binding::mainloop::standard::{IterateResult, Mainloop};
use libpulse_binding::operation::{Operation, State as OperationState};
use libpulse_binding::proplist::{properties, Proplist};
use tracing::{debug, info, warn};

use super::{MatchingPolicy, Session, SessionError};

/// Server-default endpoint selectors.
const DEFAULT_SINK: &str = "@DEFAULT_SINK@";
const DEFAULT_SOURCE: &str = "@DEFAULT_SOURCE@";

/// Property keys without a libpulse constant (PipeWire-era metadata).
const PROP_NODE_NAME: &str = "node.name";
const PROP_AUDIO_POSITION: &str = "audio.position";

/// Namespace prefix for hardware endpoints exposed under the extended policy.
const DEVICE_NAMESPACE: &str = "mixbridge.device";

/// Client name registered with the server.
const CLIENT_NAME: &str = "mixbridge";

/// Raw per-stream fields captured during enumeration.
struct StreamRow {
    index: u32,
    channels: u8,
    process_binary: Option<String>,
    media_name: Option<String>,
    application_name: Option<String>,
}

/// Raw per-device fields captured during enumeration.
struct DeviceRow {
    index: u32,
    channels: u8,
    has_position: bool,
    media_name: Option<String>,
    node_name: Option<String>,
}

/// Directory of controllable sessions on one PulseAudio server.
pub struct SessionDirectory {
    mainloop: Rc<RefCell<Mainloop>>,
    context: Rc<RefCell<Context>>,
    policy: MatchingPolicy,
}

impl SessionDirectory {
    /// Connect to the sound server and register our client name.
    ///
    /// A failed handshake is fatal - there is no directory without a server.
    pub fn connect(policy: MatchingPolicy) -> Result<Self, SessionError> {
        let mut proplist = Proplist::new()
            .ok_or_else(|| SessionError::Connect("failed to allocate proplist".into()))?;
        proplist
            .set_str(properties::APPLICATION_NAME, CLIENT_NAME)
            .map_err(|_| SessionError::Connect("failed to set client name".into()))?;

        let mainloop = Rc::new(RefCell::new(Mainloop::new().ok_or_else(|| {
            SessionError::Connect("failed to create mainloop".into())
        })?));

        let context = Rc::new(RefCell::new(
            Context::new_with_proplist(mainloop.borrow().deref(), CLIENT_NAME, &proplist)
                .ok_or_else(|| SessionError::Connect("failed to create context".into()))?,
        ));

        context
            .borrow_mut()
            .connect(None, FlagSet::NOFLAGS, None)
            .map_err(|e| SessionError::Connect(ToString::to_string(&e)))?;

        // Drive the mainloop until the server has accepted the registration.
        loop {
            match mainloop.borrow_mut().iterate(true) {
                IterateResult::Success(_) => {}
                IterateResult::Quit(_) | IterateResult::Err(_) => {
                    return Err(SessionError::Connect(
                        "mainloop quit during handshake".into(),
                    ));
                }
            }
            match context.borrow().get_state() {
                State::Ready => break,
                State::Failed | State::Terminated => {
                    return Err(SessionError::Connect(
                        "server rejected the connection".into(),
                    ));
                }
                _ => {}
            }
        }

        debug!("Created session directory instance");

        Ok(Self {
            mainloop,
            context,
            policy,
        })
    }

    /// Enumerate every controllable endpoint from live server state.
    ///
    /// Nothing is cached across calls - applications start and stop, and a
    /// stale index would address the wrong stream. Missing master endpoints
    /// are tolerated; a failed stream enumeration fails the whole call.
    pub fn get_all_sessions(&self) -> Result<Vec<Session>, SessionError> {
        let mut sessions = Vec::new();

        match self.master_sink_session() {
            Ok(session) => sessions.push(session),
            Err(e) => warn!("Failed to get master audio sink session: {}", e),
        }

        match self.master_source_session() {
            Ok(session) => sessions.push(session),
            Err(e) => warn!("Failed to get master audio source session: {}", e),
        }

        // Without the stream list there is nothing useful to map.
        self.collect_streams(&mut sessions)?;

        if self.policy == MatchingPolicy::Extended {
            self.collect_devices(&mut sessions)?;
        }

        Ok(sessions)
    }

    /// Close the server connection. The directory is gone afterwards; build
    /// a new one to enumerate again.
    pub fn release(self) {
        debug!("Released session directory instance");
    }

    fn master_sink_session(&self) -> Result<Session, SessionError> {
        let found: Rc<Cell<Option<(u32, u8)>>> = Rc::new(Cell::new(None));

        let operation = {
            let found = Rc::clone(&found);
            self.context.borrow().introspect().get_sink_info_by_name(
                DEFAULT_SINK,
                move |list| {
                    if let ListResult::Item(info) = list {
                        found.set(Some((info.index, info.channel_map.len())));
                    }
                },
            )
        };
        self.wait_for(operation)?;

        let (index, channels) = found
            .get()
            .ok_or_else(|| SessionError::Request("server returned no default sink".into()))?;

        Ok(Session::Master {
            output: true,
            index,
            channels,
        })
    }

    fn master_source_session(&self) -> Result<Session, SessionError> {
        let found: Rc<Cell<Option<(u32, u8)>>> = Rc::new(Cell::new(None));

        let operation = {
            let found = Rc::clone(&found);
            self.context.borrow().introspect().get_source_info_by_name(
                DEFAULT_SOURCE,
                move |list| {
                    if let ListResult::Item(info) = list {
                        found.set(Some((info.index, info.channel_map.len())));
                    }
                },
            )
        };
        self.wait_for(operation)?;

        let (index, channels) = found
            .get()
            .ok_or_else(|| SessionError::Request("server returned no default source".into()))?;

        Ok(Session::Master {
            output: false,
            index,
            channels,
        })
    }

    fn collect_streams(&self, sessions: &mut Vec<Session>) -> Result<(), SessionError> {
        let rows: Rc<RefCell<Vec<StreamRow>>> = Rc::new(RefCell::new(Vec::new()));
        let failed = Rc::new(Cell::new(false));

        let operation = {
            let rows = Rc::clone(&rows);
            let failed = Rc::clone(&failed);
            self.context
                .borrow()
                .introspect()
                .get_sink_input_info_list(move |list| match list {
                    ListResult::Item(info) => rows.borrow_mut().push(StreamRow {
                        index: info.index,
                        channels: info.channel_map.len(),
                        process_binary: info
                            .proplist
                            .get_str(properties::APPLICATION_PROCESS_BINARY),
                        media_name: info.proplist.get_str(properties::MEDIA_NAME),
                        application_name: info.proplist.get_str(properties::APPLICATION_NAME),
                    }),
                    ListResult::End => {}
                    ListResult::Error => failed.set(true),
                })
        };
        self.wait_for(operation)?;

        if failed.get() {
            return Err(SessionError::Enumerate("sink input listing failed".into()));
        }

        for row in rows.borrow_mut().drain(..) {
            let index = row.index;
            let channels = row.channels;
            match stream_display_name(self.policy, row) {
                Some(name) => {
                    info!(stream = index, %name, "Discovered stream");
                    sessions.push(Session::Application {
                        name,
                        index,
                        channels,
                    });
                }
                None => {
                    debug!(stream = index, "Stream missing naming properties, skipping");
                }
            }
        }

        Ok(())
    }

    fn collect_devices(&self, sessions: &mut Vec<Session>) -> Result<(), SessionError> {
        let rows: Rc<RefCell<Vec<DeviceRow>>> = Rc::new(RefCell::new(Vec::new()));
        let failed = Rc::new(Cell::new(false));

        let operation = {
            let rows = Rc::clone(&rows);
            let failed = Rc::clone(&failed);
            self.context
                .borrow()
                .introspect()
                .get_sink_info_list(move |list| match list {
                    ListResult::Item(info) => rows.borrow_mut().push(DeviceRow {
                        index: info.index,
                        channels: info.channel_map.len(),
                        has_position: info.proplist.get_str(PROP_AUDIO_POSITION).is_some(),
                        media_name: info.proplist.get_str(properties::MEDIA_NAME),
                        node_name: info.proplist.get_str(PROP_NODE_NAME),
                    }),
                    ListResult::End => {}
                    ListResult::Error => failed.set(true),
                })
        };
        self.wait_for(operation)?;

        if failed.get() {
            return Err(SessionError::Enumerate("sink listing failed".into()));
        }

        for row in rows.borrow_mut().drain(..) {
            let index = row.index;
            let channels = row.channels;
            match device_display_name(row) {
                Some(name) => {
                    info!(sink = index, %name, "Discovered device endpoint");
                    sessions.push(Session::Device {
                        name,
                        index,
                        channels,
                    });
                }
                None => {
                    debug!(sink = index, "Sink missing naming properties, skipping");
                }
            }
        }

        Ok(())
    }

    /// Drive the mainloop until `operation` finishes.
    fn wait_for<G: ?Sized>(&self, operation: Operation<G>) -> Result<(), SessionError> {
        loop {
            match self.mainloop.borrow_mut().iterate(true) {
                IterateResult::Success(_) => {}
                IterateResult::Quit(_) | IterateResult::Err(_) => {
                    return Err(SessionError::Request("mainloop quit mid-request".into()));
                }
            }
            match operation.get_state() {
                OperationState::Done => return Ok(()),
                OperationState::Running => {}
                OperationState::Cancelled => {
                    return Err(SessionError::Request("operation cancelled".into()));
                }
            }
        }
    }
}

impl Drop for SessionDirectory {
    fn drop(&mut self) {
        self.context.borrow_mut().disconnect();
    }
}

/// Display name for a playback stream, if its required properties are
/// present under the active policy.
fn stream_display_name(policy: MatchingPolicy, row: StreamRow) -> Option<String> {
    match policy {
        MatchingPolicy::Legacy => row.process_binary,
        MatchingPolicy::Extended => {
            let media = row.media_name?;
            let application = row.application_name?;
            Some(format!("{}: {}", media, application))
        }
    }
}

/// Display name for a hardware endpoint. Only endpoints carrying positional
/// audio metadata are addressable, and never under an empty name.
fn device_display_name(row: DeviceRow) -> Option<String> {
    let mut name = String::new();
    if row.has_position {
        let media = row.media_name?;
        let node = row.node_name?;
        name = format!("{}: {}~{}", DEVICE_NAMESPACE, media, node);
    }

    if name.is_empty() {
        return None;
    }
    Some(name)
}
