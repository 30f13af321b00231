// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Frames of the table-change notification protocol.
//!
//! ```text
//! client -> server   1,<table>|
//! server -> client   2|<table>,<purge>,<id>\n
//! server -> client   3|<connectionString>,<online>\n
//! ```

use std::fmt;

use crate::error::ChangeNotificationError;

/// A changed row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Notification {
    /// Table name.
    pub table: String,
    /// Whether cached copies of the table must be dropped entirely.
    pub purge: bool,
    /// Row identifier.
    pub id: i64,
}

impl Notification {
    /// Creates a row notification.
    #[must_use]
    pub fn new(table: impl Into<String>, purge: bool, id: i64) -> Self {
        Self {
            table: table.into(),
            purge,
            id,
        }
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeFrame {
    /// Client interest in a table.
    Register {
        /// Table name.
        table: String,
    },
    /// A row changed.
    Notify(Notification),
    /// Server liveness.
    Heartbeat {
        /// Connection string of the notifying server.
        connection_string: String,
        /// Whether the server's database is reachable.
        online: bool,
    },
}

impl ChangeFrame {
    /// Parses one client frame, without its `|` terminator.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeNotificationError::Malformed`] unless the text is
    /// `1,<table>`.
    pub fn parse_client(text: &str) -> Result<Self, ChangeNotificationError> {
        let text = text.trim();
        match text.split_once(',') {
            Some(("1", table)) if valid_field(table) && !table.is_empty() => Ok(Self::Register {
                table: table.to_string(),
            }),
            _ => Err(ChangeNotificationError::Malformed(text.to_string())),
        }
    }

    /// Parses one server frame, without its newline.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeNotificationError::Malformed`] for anything but a
    /// notify or heartbeat frame.
    pub fn parse_server(line: &str) -> Result<Self, ChangeNotificationError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let malformed = || ChangeNotificationError::Malformed(line.to_string());
        let (kind, body) = line.split_once('|').ok_or_else(malformed)?;

        match kind {
            "2" => {
                let mut fields = body.splitn(3, ',');
                let (Some(table), Some(purge), Some(id)) =
                    (fields.next(), fields.next(), fields.next())
                else {
                    return Err(malformed());
                };
                Ok(Self::Notify(Notification {
                    table: table.to_string(),
                    purge: parse_bool(purge).ok_or_else(malformed)?,
                    id: id.parse().map_err(|_| malformed())?,
                }))
            }
            "3" => {
                let (connection_string, online) = body.rsplit_once(',').ok_or_else(malformed)?;
                Ok(Self::Heartbeat {
                    connection_string: connection_string.to_string(),
                    online: parse_bool(online).ok_or_else(malformed)?,
                })
            }
            _ => Err(malformed()),
        }
    }
}

impl fmt::Display for ChangeFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register { table } => write!(f, "1,{table}|"),
            Self::Notify(n) => writeln!(f, "2|{},{},{}", n.table, n.purge, n.id),
            Self::Heartbeat {
                connection_string,
                online,
            } => writeln!(f, "3|{connection_string},{online}"),
        }
    }
}

fn parse_bool(text: &str) -> Option<bool> {
    match text {
        "true" | "True" | "1" => Some(true),
        "false" | "False" | "0" => Some(false),
        _ => None,
    }
}

/// Table names travel inside frames and must not contain delimiters.
pub(crate) fn valid_field(text: &str) -> bool {
    !text.contains(['|', ',', '\n', '\r'])
}
