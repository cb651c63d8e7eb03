//! Typed control surface.
//!
//! Each command maps onto exactly one device operation. The serde encoding
//! is for tooling convenience only; it is not a wire format.

use serde::{Deserialize, Serialize};

use crate::client::Client;
use crate::device::Device;
use crate::error::{IonError, Result};
use crate::flags::BufferFlags;
use crate::handle::HandleId;
use crate::share::Fd;

/// Handler for device-specific commands.
pub trait CustomHandler: Send + Sync {
    fn handle(&self, device: &Device, client: &Client, cmd: u32, arg: u64) -> Result<i64>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlCommand {
    Allocate {
        len: usize,
        #[serde(default = "default_align")]
        align: usize,
        heap_mask: u32,
        #[serde(default)]
        flags: BufferFlags,
    },
    Free {
        handle: HandleId,
    },
    #[serde(alias = "export")]
    Share {
        handle: HandleId,
    },
    Import {
        fd: Fd,
    },
    Sync {
        fd: Fd,
    },
    Phys {
        handle: HandleId,
    },
    Custom {
        cmd: u32,
        arg: u64,
    },
}

fn default_align() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum ControlReply {
    Handle { handle: HandleId },
    Fd { fd: Fd },
    Phys { addr: u64, len: usize },
    Custom { value: i64 },
    Done,
}

impl Device {
    /// Run one control command on behalf of `client`.
    pub fn dispatch(&self, client: &Client, command: ControlCommand) -> Result<ControlReply> {
        match command {
            ControlCommand::Allocate {
                len,
                align,
                heap_mask,
                flags,
            } => self
                .allocate(client, len, align, heap_mask, flags)
                .map(|handle| ControlReply::Handle { handle }),
            ControlCommand::Free { handle } => {
                self.free(client, handle).map(|()| ControlReply::Done)
            }
            ControlCommand::Share { handle } => self
                .export(client, handle)
                .map(|fd| ControlReply::Fd { fd }),
            ControlCommand::Import { fd } => self
                .import(client, fd)
                .map(|handle| ControlReply::Handle { handle }),
            ControlCommand::Sync { fd } => self.sync_for_device(fd).map(|()| ControlReply::Done),
            ControlCommand::Phys { handle } => self
                .phys(client, handle)
                .map(|(addr, len)| ControlReply::Phys { addr, len }),
            ControlCommand::Custom { cmd, arg } => self.custom(client, cmd, arg),
        }
    }

    fn custom(&self, client: &Client, cmd: u32, arg: u64) -> Result<ControlReply> {
        let Some(handler) = &self.custom else {
            tracing::debug!(client = %client.id(), cmd, "custom command without a handler");
            return Err(IonError::unsupported("custom", "device"));
        };
        handler
            .handle(self, client, cmd, arg)
            .map(|value| ControlReply::Custom { value })
    }
}
