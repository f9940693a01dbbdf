//! Tab completion against the remote filesystem and command table.
//!
//! - First word: `compgen -c` in the tracked environment
//! - Later words: the last token is a path fragment; entries of its directory
//!   are listed remotely and directories get a trailing `/`
//!
//! Every probe failure yields no candidates.

use std::collections::BTreeSet;

use tracing::debug;

use super::quote::{grep_escape, quote_path, shell_quote};
use super::state::ShellState;
use crate::remote::connection::ConnectionSession;

/// Candidates for `partial`, as full command lines, sorted and deduplicated.
pub(crate) async fn complete(
    session: &ConnectionSession,
    state: &ShellState,
    partial: &str,
) -> Vec<String> {
    if partial.trim().is_empty() || !session.is_connected() {
        return Vec::new();
    }

    let (head, fragment) = match partial.rfind([' ', '\t']) {
        Some(i) => partial.split_at(i + 1),
        None => ("", partial),
    };

    let candidates = if head.trim().is_empty() {
        complete_command(session, state, fragment).await
    } else {
        complete_path(session, state, fragment).await
    };

    let lines: BTreeSet<String> = candidates
        .into_iter()
        .map(|candidate| format!("{}{}", head, candidate))
        .collect();
    debug!("{} completion(s) for {:?}", lines.len(), partial);
    lines.into_iter().collect()
}

async fn complete_command(session: &ConnectionSession, state: &ShellState, prefix: &str) -> Vec<String> {
    let command = state.build_command(&format!("compgen -c -- {}", shell_quote(prefix)));
    let (stdout, _) = session.execute_command(&command, None).await;

    stdout
        .lines()
        .map(str::trim)
        .filter(|name| !name.is_empty() && name.starts_with(prefix))
        .map(str::to_string)
        .collect()
}

async fn complete_path(session: &ConnectionSession, state: &ShellState, fragment: &str) -> Vec<String> {
    let (dir_part, name_prefix) = match fragment.rfind('/') {
        Some(i) => fragment.split_at(i + 1),
        None => ("", fragment),
    };
    let directory = if dir_part.is_empty() {
        state.cwd.clone()
    } else {
        state.resolve_path(dir_part)
    };

    let mut listing = format!("ls -1a {} 2>/dev/null", quote_path(&directory));
    if !name_prefix.is_empty() {
        listing.push_str(&format!(
            " | grep {}",
            shell_quote(&format!("^{}", grep_escape(name_prefix)))
        ));
    }
    let (stdout, _) = session.execute_command(&listing, None).await;

    let show_hidden = name_prefix.starts_with('.');
    let names: Vec<&str> = stdout
        .lines()
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .filter(|name| name.starts_with(name_prefix))
        .filter(|name| show_hidden || !name.starts_with('.'))
        .collect();
    if names.is_empty() {
        return Vec::new();
    }

    let directories = directory_entries(session, &directory, &names).await;
    names
        .into_iter()
        .map(|name| {
            let suffix = if directories.contains(name) { "/" } else { "" };
            format!("{}{}{}", dir_part, name, suffix)
        })
        .collect()
}

/// Which of `names` inside `directory` are directories, in one round trip.
async fn directory_entries(
    session: &ConnectionSession,
    directory: &str,
    names: &[&str],
) -> BTreeSet<String> {
    let quoted: Vec<String> = names.iter().map(|name| shell_quote(name)).collect();
    let command = format!(
        "cd {} && for f in {}; do test -d \"$f\" && echo \"$f\"; done",
        quote_path(directory),
        quoted.join(" ")
    );
    let (stdout, _) = session.execute_command(&command, None).await;
    stdout.lines().map(str::to_string).collect()
}
