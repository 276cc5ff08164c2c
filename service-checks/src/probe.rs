//! One module per kind of service. Each type embeds the common [Service](crate::Service)
//! fields and adds its own, all in the PascalCase keys of the configuration file.

mod custom;
mod dns;
mod ftp;
mod imap;
mod ldap;
mod ping;
mod pop3;
mod rdp;
mod smb;
mod smtp;
mod sql;
mod ssh;
mod tcp;
mod vnc;
mod web;
mod winrm;

pub use custom::Custom;
pub use dns::{Dns, DnsRecord, RecordKind};
pub use ftp::Ftp;
pub use imap::Imap;
pub use ldap::Ldap;
pub use ping::Ping;
pub use pop3::Pop3;
pub use rdp::Rdp;
pub use smb::Smb;
pub use smtp::Smtp;
pub use sql::{Sql, SqlQuery};
pub use ssh::{Ssh, SshCommand};
pub use tcp::Tcp;
pub use vnc::Vnc;
pub use web::{Web, WebUrl};
pub use winrm::{WinRm, WinRmCommand};

pub use crate::matching::RemoteFile;
