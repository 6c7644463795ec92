//! veil, an XRender compositing manager for X11.
//!
//! Redirects every toplevel to offscreen storage and composites the screen
//! from accumulated damage, with drop shadows, fades and per-window opacity.

mod compositor;
mod config;

use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use x11rb::connection::Connection;
use x11rb::protocol::xproto::ConnectionExt;

use compositor::Compositor;
use compositor::xrender::XRenderBackend;
use config::Config;

const X11_TOKEN: Token = Token(0);

fn parse_args() -> Result<Option<PathBuf>> {
    let mut args = std::env::args().skip(1);
    let mut config_path = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args.next().context("--config requires a path")?;
                config_path = Some(PathBuf::from(path));
            }
            "--help" | "-h" => {
                println!("usage: veil [--config PATH]");
                std::process::exit(0);
            }
            other => bail!("unknown argument {other:?}"),
        }
    }
    Ok(config_path)
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("veil=debug,info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = parse_args()?;
    let config = Config::load(config_path.as_deref()).context("Failed to load configuration")?;

    let (conn, screen_num) = x11rb::connect(None).context("Failed to connect to X server")?;
    let conn = Arc::new(conn);
    info!("Connected to X server, screen {}", screen_num);

    let backend = XRenderBackend::new(conn.clone(), screen_num)
        .context("Failed to initialize the render backend")?;
    let root = conn.setup().roots[screen_num].root;
    let mut comp = Compositor::new(backend, config);

    // Pick up everything already on screen, bottom to top.
    let tree = conn
        .query_tree(root)
        .context("query_tree failed")?
        .reply()
        .context("query_tree reply failed")?;
    debug!("scanning {} existing windows", tree.children.len());
    for &child in &tree.children {
        comp.add_window(child);
    }
    comp.full_screen_damage();
    // Paint the initial frame now; the loop below only paints after an
    // event or fade tick, and neither may arrive for a while.
    comp.tick(Instant::now());

    let mut poll = Poll::new().context("Failed to create poll instance")?;
    let mut events = Events::with_capacity(8);
    let x11_fd = conn.stream().as_raw_fd();
    poll.registry()
        .register(&mut SourceFd(&x11_fd), X11_TOKEN, Interest::READABLE)
        .context("Failed to register the X connection for polling")?;

    info!("Compositing started");
    loop {
        comp.flush();
        let timeout = comp.poll_timeout(Instant::now());
        if let Err(e) = poll.poll(&mut events, timeout) {
            if e.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e).context("poll failed");
        }

        while let Some(event) = conn
            .poll_for_event()
            .context("X connection broke while reading events")?
        {
            comp.handle_event(&event);
        }
        comp.tick(Instant::now());
    }
}
