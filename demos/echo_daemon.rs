// Copyright 2026 taskmaster contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A TCP echo server built entirely out of `Master` submissions: one
//! `Read` task accepting connections, one `Read` task per connection
//! echoing bytes back, and one `Timer` task per connection closing it
//! after it sits idle too long.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use taskmaster::{Handle, Master, TaskContext};

const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

struct Acceptor {
    listener: TcpListener,
    handle: Handle,
}

struct Connection {
    stream: TcpStream,
    read_handle: Handle,
    idle_handle: Handle,
}

fn main() {
    tracing_subscriber::fmt::init();

    let master = Master::new();
    let listener = TcpListener::bind("127.0.0.1:7007").expect("failed to bind echo listener");
    listener.set_nonblocking(true).expect("failed to set listener nonblocking");
    let fd = listener.as_raw_fd();

    let acceptor = Arc::new(Acceptor {
        listener,
        handle: Handle::new(),
    });
    master.add_read(&acceptor.handle, fd, on_acceptable, "on_acceptable", acceptor);

    tracing::info!("echo daemon listening on 127.0.0.1:7007");
    while let Some(task) = master.fetch() {
        master.call(&task);
    }
}

fn on_acceptable(ctx: &mut TaskContext) {
    let Some(master) = ctx.master() else { return };
    let Ok(acceptor) = ctx.arg().clone().downcast::<Acceptor>() else {
        return;
    };

    loop {
        match acceptor.listener.accept() {
            Ok((stream, addr)) => {
                tracing::info!(%addr, "accepted connection");
                if let Err(err) = stream.set_nonblocking(true) {
                    tracing::warn!(error = %err, "failed to set connection nonblocking; dropping it");
                    continue;
                }
                let fd = stream.as_raw_fd();
                let conn = Arc::new(Connection {
                    stream,
                    read_handle: Handle::new(),
                    idle_handle: Handle::new(),
                });
                master.add_read(&conn.read_handle, fd, on_readable, "on_readable", conn.clone());
                master.add_timer(&conn.idle_handle, IDLE_TIMEOUT, on_idle_timeout, "on_idle_timeout", conn);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
                break;
            }
        }
    }

    let fd = acceptor.listener.as_raw_fd();
    master.add_read(&acceptor.handle, fd, on_acceptable, "on_acceptable", acceptor);
}

fn on_readable(ctx: &mut TaskContext) {
    let Some(master) = ctx.master() else { return };
    let Ok(conn) = ctx.arg().clone().downcast::<Connection>() else {
        return;
    };

    let mut buf = [0u8; 4096];
    match (&conn.stream).read(&mut buf) {
        Ok(0) => close_connection(&master, &conn),
        Ok(n) => {
            if let Err(err) = (&conn.stream).write_all(&buf[..n]) {
                tracing::debug!(error = %err, "write failed; closing connection");
                close_connection(&master, &conn);
                return;
            }
            master.cancel(&conn.idle_handle);
            master.add_timer(&conn.idle_handle, IDLE_TIMEOUT, on_idle_timeout, "on_idle_timeout", conn.clone());
            let fd = conn.stream.as_raw_fd();
            master.add_read(&conn.read_handle, fd, on_readable, "on_readable", conn);
        }
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
            let fd = conn.stream.as_raw_fd();
            master.add_read(&conn.read_handle, fd, on_readable, "on_readable", conn);
        }
        Err(err) => {
            tracing::debug!(error = %err, "read failed; closing connection");
            close_connection(&master, &conn);
        }
    }
}

fn on_idle_timeout(ctx: &mut TaskContext) {
    let Some(master) = ctx.master() else { return };
    let Ok(conn) = ctx.arg().clone().downcast::<Connection>() else {
        return;
    };
    tracing::info!("closing idle connection");
    master.cancel(&conn.read_handle);
    close_connection(&master, &conn);
}

fn close_connection(master: &Master, conn: &Connection) {
    master.cancel(&conn.read_handle);
    master.cancel(&conn.idle_handle);
    let _ = conn.stream.shutdown(std::net::Shutdown::Both);
}
