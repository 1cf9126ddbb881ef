//! CLI surface for domaind.
//!
//! `run` hosts the daemon in the foreground; everything else is a thin
//! client over the control socket.

use std::ffi::OsString;

use clap::{ArgAction, Parser, Subcommand};

use crate::core::IdKind;
use crate::daemon::ipc::{send_request, Ack, Request, Response, ResponsePayload};
use crate::Result;

#[derive(Parser, Debug)]
#[command(
    name = "domaind",
    version,
    about = "Windows-domain identity resolution daemon",
    infer_subcommands = true,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Machine-readable JSON output.
    #[arg(long, global = true, default_value_t = false)]
    pub json: bool,

    /// Debug output (repeat for more).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the daemon in the foreground.
    Run,

    /// Check that the daemon is up and protocol-compatible.
    Ping,

    /// Liveness and controller affinity, for one domain or all of them.
    Status {
        domain: Option<String>,
    },

    /// Force a domain offline, or all domains when none is named.
    Offline { domain: Option<String> },

    /// Lift a forced-offline flag and reconnect.
    Online { domain: Option<String> },

    /// Resolve a SID to its unix id.
    #[command(name = "sid-to-id")]
    SidToId { sid: String },

    /// Resolve a unix id back to its SID.
    #[command(name = "id-to-sid")]
    IdToSid {
        #[arg(value_parser = parse_kind)]
        kind: IdKind,
        id: u32,
    },

    /// Record an explicit mapping.
    Set {
        sid: String,
        #[arg(value_parser = parse_kind)]
        kind: IdKind,
        id: u32,
    },

    /// Remove a mapping. Both sides must match what is stored.
    Remove {
        sid: String,
        #[arg(value_parser = parse_kind)]
        kind: IdKind,
        id: u32,
    },

    /// Allocate the next free id for a SID.
    Allocate {
        sid: String,
        #[arg(value_parser = parse_kind)]
        kind: IdKind,
    },

    /// Resolve `DOMAIN name` to a SID through the domain's controller.
    #[command(name = "lookup-name")]
    LookupName { domain: String, name: String },

    /// Resolve a SID to its qualified name through the owning domain.
    #[command(name = "lookup-sid")]
    LookupSid { sid: String },

    /// Ask a running daemon to exit.
    Shutdown,
}

fn parse_kind(raw: &str) -> std::result::Result<IdKind, String> {
    match raw.to_ascii_lowercase().as_str() {
        "uid" | "user" => Ok(IdKind::Uid),
        "gid" | "group" => Ok(IdKind::Gid),
        other => Err(format!("expected 'uid' or 'gid', got '{other}'")),
    }
}

pub fn parse_from<I, T>(args: I) -> Cli
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Cli::parse_from(args)
}

/// Run the CLI (used by bin).
pub fn run(cli: Cli) -> Result<()> {
    let json = cli.json;
    let request = match cli.command {
        Commands::Run => {
            let config = crate::config::load_or_init();
            return crate::daemon::run_daemon(config);
        }
        Commands::Ping => Request::Ping,
        Commands::Status { domain } => Request::DomainStatus { domain },
        Commands::Offline { domain } => Request::SetOffline {
            domain,
            offline: true,
        },
        Commands::Online { domain } => Request::SetOffline {
            domain,
            offline: false,
        },
        Commands::SidToId { sid } => Request::SidToId { sid },
        Commands::IdToSid { kind, id } => Request::IdToSid { kind, id },
        Commands::Set { sid, kind, id } => Request::SetMapping { sid, kind, id },
        Commands::Remove { sid, kind, id } => Request::RemoveMapping { sid, kind, id },
        Commands::Allocate { sid, kind } => Request::Allocate { sid, kind },
        Commands::LookupName { domain, name } => Request::LookupName { domain, name },
        Commands::LookupSid { sid } => Request::LookupSid { sid },
        Commands::Shutdown => Request::Shutdown,
    };

    match send_request(&request)? {
        Response::Ok { ok } => {
            print_ok(&ok, json);
            Ok(())
        }
        Response::Err { err } => {
            if json {
                println!("{}", serde_json::to_string(&err).unwrap_or_default());
            } else {
                eprintln!("error [{}]: {}", err.code, err.message);
            }
            std::process::exit(1);
        }
    }
}

fn print_ok(payload: &ResponsePayload, json: bool) {
    if json {
        println!("{}", serde_json::to_string(payload).unwrap_or_default());
        return;
    }
    println!("{}", render_human(payload));
}

fn render_human(payload: &ResponsePayload) -> String {
    match payload {
        ResponsePayload::Mapping(answer) => match (&answer.sid, answer.kind, answer.id) {
            (Some(sid), Some(kind), Some(id)) => format!("{sid} -> {kind} {id}"),
            _ => format!("{:?}", answer.status).to_lowercase(),
        },
        ResponsePayload::Resolved(answer) => {
            if !answer.found {
                return "not found".into();
            }
            match (&answer.name, &answer.sid) {
                (Some(name), Some(sid)) => format!("{name} = {sid}"),
                (None, Some(sid)) => sid.clone(),
                (Some(name), None) => name.clone(),
                (None, None) => "not found".into(),
            }
        }
        ResponsePayload::Domains(domains) => {
            let mut out = String::new();
            for d in domains {
                let dc = d
                    .dc
                    .as_deref()
                    .map(|name| format!("  dc={name}"))
                    .unwrap_or_default();
                let forced = if d.forced_offline { "  (forced)" } else { "" };
                out.push_str(&format!(
                    "{:<16} {:?}  {}{}{}\n",
                    d.name, d.kind, d.liveness, dc, forced
                ));
            }
            out.trim_end().to_string()
        }
        ResponsePayload::Pong { version, protocol } => {
            format!("domaind {version} (protocol {protocol})")
        }
        ResponsePayload::Ack(Ack::Done) => "done".into(),
        ResponsePayload::Ack(Ack::ShuttingDown) => "shutting down".into(),
    }
}
