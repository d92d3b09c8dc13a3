// SPDX-License-Identifier: Apache-2.0

//! The broker's single-threaded event loop (§4.1 "Scheduling").
//!
//! A malformed record is fatal to the whole broker — the protocol runs
//! entirely within one trusted job, so there is no recovery story beyond
//! exiting (§7). An individual orderly peer close only drops that one
//! connection.

use crate::address;
use crate::connection::Connection;
use crate::directory::Directory;
use crate::error::{BrokerError, Result};
use mio::net::UnixListener;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use tracing::{info, warn};

const LISTENER_TOKEN: Token = Token(0);

pub struct Daemon {
    poll: Poll,
    listener: UnixListener,
    connections: HashMap<Token, Connection>,
    directory: Directory,
    next_token: usize,
    any_client_ever: bool,
}

impl Daemon {
    pub fn bind(proxy_id: u32) -> Result<Self> {
        let std_listener = address::bind_listener(proxy_id).map_err(|e| BrokerError::Syscall {
            call: "bind(broker listener)",
            source: e,
        })?;
        std_listener.set_nonblocking(true).map_err(|e| BrokerError::Syscall {
            call: "set_nonblocking",
            source: e,
        })?;
        let mut listener = UnixListener::from_std(std_listener);
        let poll = Poll::new().map_err(|e| BrokerError::Syscall {
            call: "mio::Poll::new",
            source: e,
        })?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(|e| BrokerError::Syscall {
                call: "registry.register(listener)",
                source: e,
            })?;
        Ok(Self {
            poll,
            listener,
            connections: HashMap::new(),
            directory: Directory::new(),
            next_token: 1,
            any_client_ever: false,
        })
    }

    /// Runs until every client that ever connected has disconnected.
    pub fn run(mut self) -> Result<()> {
        let mut events = Events::with_capacity(128);
        loop {
            self.poll.poll(&mut events, None).map_err(|e| BrokerError::Syscall {
                call: "mio::Poll::poll",
                source: e,
            })?;

            let tokens: Vec<Token> = events.iter().map(|e| e.token()).collect();
            for token in tokens {
                if token == LISTENER_TOKEN {
                    self.accept_all()?;
                    continue;
                }
                self.service(token)?;
            }

            self.reap_dead();
            if self.any_client_ever && self.connections.is_empty() {
                info!("all broker clients disconnected, exiting");
                return Ok(());
            }
        }
    }

    fn accept_all(&mut self) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    let mut conn = Connection::new(stream);
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    self.poll
                        .registry()
                        .register(&mut conn.stream, token, conn.interest())
                        .map_err(|e| BrokerError::Syscall {
                            call: "registry.register(connection)",
                            source: e,
                        })?;
                    self.connections.insert(token, conn);
                    self.any_client_ever = true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    return Err(BrokerError::Syscall {
                        call: "accept",
                        source: e,
                    })
                }
            }
        }
    }

    fn service(&mut self, token: Token) -> Result<()> {
        let Some(conn) = self.connections.get_mut(&token) else {
            return Ok(());
        };

        let prior_interest = conn.interest();
        let result = if matches!(prior_interest, Interest::READABLE) {
            conn.on_readable(&mut self.directory)
        } else {
            conn.on_writable(&self.directory)
        };

        if let Err(e) = result {
            warn!(error = %e, "fatal broker protocol error, shutting down");
            return Err(e);
        }

        if !conn.is_alive() {
            return Ok(());
        }

        let new_interest = conn.interest();
        self.poll
            .registry()
            .reregister(&mut conn.stream, token, new_interest)
            .map_err(|e| BrokerError::Syscall {
                call: "registry.reregister",
                source: e,
            })?;
        Ok(())
    }

    fn reap_dead(&mut self) {
        let dead: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, c)| !c.is_alive())
            .map(|(t, _)| *t)
            .collect();
        for token in dead {
            if let Some(mut conn) = self.connections.remove(&token) {
                let _ = self.poll.registry().deregister(&mut conn.stream);
            }
        }
    }
}
