//! The program behind the `pre-receive`, `update` and `post-receive` hook shims.
//!
//! It forwards what `receive-pack` hands to the hook to the server that spawned it and
//! relays the answer: messages go to stderr, a rejection becomes exit code 1.

use std::io::{Read, Write};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use forge_receive_pack::hooks::client::HookClient;
use forge_receive_pack::hooks::env::HookContext;
use forge_receive_pack::hooks::{HookKind, HookOutput};
use forge_receive_pack::refs::RefUpdate;
use forge_receive_pack::Error;

#[derive(Debug, Parser)]
#[command(name = "forge-hook", about = "Relay git server hooks to the forge", version)]
struct Args {
    #[command(subcommand)]
    hook: Hook,
}

#[derive(Debug, Subcommand)]
enum Hook {
    /// Reads `<old> <new> <ref>` lines from stdin.
    PreReceive,
    Update {
        #[arg(value_name = "REF")]
        ref_name: String,
        old: String,
        new: String,
    },
    /// Reads `<old> <new> <ref>` lines from stdin.
    PostReceive,
}

fn main() -> ExitCode {
    forge_receive_pack::trace::init_hook();
    let args = Args::parse();
    match run(args.hook) {
        Ok(out) => {
            let rejected = out.is_rejected();
            report(&out);
            if rejected {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(err) => {
            tracing::debug!(error = ?err, "hook failed");
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(hook: Hook) -> Result<HookOutput, Error> {
    let Some(ctx) = HookContext::from_process_env()? else {
        tracing::debug!("hook callback is not configured");
        return Ok(HookOutput::default());
    };
    let (kind, updates) = match hook {
        Hook::PreReceive => (HookKind::PreReceive, read_updates()?),
        Hook::PostReceive => (HookKind::PostReceive, read_updates()?),
        Hook::Update { ref_name, old, new } => (
            HookKind::Update,
            vec![RefUpdate::parse_line(&format!("{old} {new} {ref_name}"))?],
        ),
    };
    HookClient::from_context(&ctx).call(kind, &ctx.input(updates))
}

fn read_updates() -> Result<Vec<RefUpdate>, Error> {
    let mut text = String::new();
    std::io::stdin().read_to_string(&mut text)?;
    RefUpdate::parse_lines(&text)
}

fn report(out: &HookOutput) {
    let mut stderr = std::io::stderr().lock();
    for line in &out.messages {
        let _ = writeln!(stderr, "{line}");
    }
    if let Some(error) = &out.error {
        let _ = writeln!(stderr, "Error: {error}");
    }
}
