//! `zwp_idle_inhibit_manager_v1` client.
//!
//! Binds `wl_compositor` and the idle inhibit manager, creates one bare surface for
//! inhibitors to hang off, and watches the socket so a lost compositor is noticed
//! without waiting for the next request to fail.

use std::{io, os::fd::OwnedFd};

use tokio::io::{unix::AsyncFd, Interest};
use tracing::{debug, info, warn};
use wayland_client::{
    backend::WaylandError,
    delegate_noop,
    protocol::{
        wl_compositor::WlCompositor,
        wl_registry::{self, WlRegistry},
        wl_surface::WlSurface,
    },
    Connection, Dispatch, DispatchError, EventQueue, Proxy, QueueHandle,
};
use wayland_protocols::wp::idle_inhibit::zv1::client::{
    zwp_idle_inhibit_manager_v1::ZwpIdleInhibitManagerV1,
    zwp_idle_inhibitor_v1::ZwpIdleInhibitorV1,
};

use crate::{
    aggregator::Compositor,
    error::{ConnectError, InhibitError},
};

#[derive(Default)]
struct Globals {
    compositor: Option<(WlCompositor, u32)>,
    surface: Option<WlSurface>,
    idle_manager: Option<(ZwpIdleInhibitManagerV1, u32)>,
}

impl Dispatch<WlRegistry, ()> for Globals {
    fn event(
        state: &mut Self,
        registry: &WlRegistry,
        event: wl_registry::Event,
        _: &(),
        _: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_registry::Event::Global {
                name,
                interface,
                version,
            } => {
                if interface == WlCompositor::interface().name && state.compositor.is_none() {
                    debug!("binding {interface} v{version} (global {name})");
                    let compositor: WlCompositor = registry.bind(name, 1, qh, ());
                    state.surface = Some(compositor.create_surface(qh, ()));
                    state.compositor = Some((compositor, name));
                } else if interface == ZwpIdleInhibitManagerV1::interface().name
                    && state.idle_manager.is_none()
                {
                    debug!("binding {interface} v{version} (global {name})");
                    state.idle_manager = Some((registry.bind(name, 1, qh, ()), name));
                }
            }
            wl_registry::Event::GlobalRemove { name } => {
                if state.compositor.as_ref().is_some_and(|(_, n)| *n == name) {
                    warn!("compositor withdrew wl_compositor");
                    state.compositor = None;
                    state.surface = None;
                }
                if state.idle_manager.as_ref().is_some_and(|(_, n)| *n == name) {
                    warn!("compositor withdrew zwp_idle_inhibit_manager_v1");
                    state.idle_manager = None;
                }
            }
            _ => {}
        }
    }
}

delegate_noop!(Globals: ignore WlCompositor);
delegate_noop!(Globals: ignore WlSurface);
delegate_noop!(Globals: ignore ZwpIdleInhibitManagerV1);
delegate_noop!(Globals: ignore ZwpIdleInhibitorV1);

pub struct WaylandCompositor {
    conn: Connection,
    queue: EventQueue<Globals>,
    qh: QueueHandle<Globals>,
    globals: Globals,
    _registry: WlRegistry,
    socket: AsyncFd<OwnedFd>,
}

impl WaylandCompositor {
    /// Connects to `$WAYLAND_DISPLAY` and binds the globals inhibitors need.
    ///
    /// Must run inside the tokio runtime, which watches the socket.
    pub fn connect() -> Result<Self, ConnectError> {
        let conn = Connection::connect_to_env()?;
        let mut queue = conn.new_event_queue();
        let qh = queue.handle();
        let registry = conn.display().get_registry(&qh, ());

        let mut globals = Globals::default();
        queue.roundtrip(&mut globals)?;

        if globals.compositor.is_none() || globals.surface.is_none() {
            return Err(ConnectError::MissingGlobal("wl_compositor"));
        }
        if globals.idle_manager.is_none() {
            return Err(ConnectError::MissingGlobal("zwp_idle_inhibit_manager_v1"));
        }

        let fd = conn.backend().poll_fd().try_clone_to_owned()?;
        let socket = AsyncFd::with_interest(fd, Interest::READABLE)?;

        info!("connected to Wayland compositor");
        Ok(Self {
            conn,
            queue,
            qh,
            globals,
            _registry: registry,
            socket,
        })
    }

    /// Resolves with the reason once the connection is unusable.
    ///
    /// Cancel safe: dropping the future abandons the pending read.
    pub async fn closed(&mut self) -> DispatchError {
        loop {
            if let Err(e) = self.queue.dispatch_pending(&mut self.globals) {
                return e;
            }
            if let Err(e) = self.conn.flush() {
                return DispatchError::Backend(e);
            }
            let Some(guard) = self.queue.prepare_read() else {
                continue;
            };

            let mut ready = match self.socket.readable().await {
                Ok(ready) => ready,
                Err(e) => return DispatchError::Backend(WaylandError::Io(e)),
            };
            match guard.read() {
                Ok(_) => {}
                Err(WaylandError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                    ready.clear_ready();
                }
                Err(e) => return DispatchError::Backend(e),
            }
        }
    }

    fn roundtrip(&mut self) -> Result<(), InhibitError> {
        self.queue.roundtrip(&mut self.globals)?;
        Ok(())
    }
}

impl Compositor for WaylandCompositor {
    type Handle = ZwpIdleInhibitorV1;

    fn create_inhibitor(&mut self) -> Result<Self::Handle, InhibitError> {
        let (manager, _) = self
            .globals
            .idle_manager
            .as_ref()
            .ok_or(InhibitError::NoManager)?;
        let surface = self.globals.surface.as_ref().ok_or(InhibitError::NoSurface)?;

        let inhibitor = manager.create_inhibitor(surface, &self.qh, ());
        self.roundtrip()?;
        Ok(inhibitor)
    }

    fn destroy_inhibitor(&mut self, handle: Self::Handle) -> Result<(), InhibitError> {
        handle.destroy();
        self.roundtrip()
    }
}
