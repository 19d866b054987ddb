//! Admin shell (component H): the sole `exec` command surface, a `ls`
//! table renderer over the puppet address book.

use sshpuppet_core::{AccessPolicy, ClientIdentity, PuppetAddressBook};

const COLUMN_GAP: &str = "  ";

/// Splits an `exec` request's command line the way a shell would for this
/// narrow grammar: whitespace-separated tokens, no quoting support.
pub fn parse_argv(data: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(data).split_whitespace().map(str::to_string).collect()
}

/// Runs the dispatcher and returns `(output, exit_code)`. The admin check
/// is defence in depth past the session gate (§4.D), which should already
/// have rejected non-admin `exec` requests.
pub fn dispatch(identity: &ClientIdentity, policy: &AccessPolicy, address_book: &PuppetAddressBook, argv: &[String]) -> (String, u32) {
    if !identity.is_admin() {
        return ("Nope, only for admins.\n".to_string(), 1);
    }

    match argv.first().map(String::as_str) {
        None => ("Available commands: ls\n".to_string(), 0),
        Some("ls") => (render_ls(policy, address_book), 0),
        Some(_) => ("Unknown command\n".to_string(), 0),
    }
}

fn render_ls(policy: &AccessPolicy, address_book: &PuppetAddressBook) -> String {
    let snapshot = address_book.snapshot();
    if snapshot.is_empty() {
        return "No puppets\n".to_string();
    }

    let mut rows = Vec::with_capacity(snapshot.len());
    for (name, ports) in &snapshot {
        let named_ports: Vec<String> = ports
            .keys()
            .map(|port| match policy.service_name(*port) {
                Some(service) => format!("{service}={port}"),
                None => format!("unknown={port}"),
            })
            .collect();
        rows.push([name.clone(), named_ports.join(",")]);
    }

    render_table(["PUPPET", "PORTS"], &rows)
}

fn render_table(headers: [&str; 2], rows: &[[String; 2]]) -> String {
    let mut widths = [headers[0].len(), headers[1].len()];
    for row in rows {
        widths[0] = widths[0].max(row[0].len());
        widths[1] = widths[1].max(row[1].len());
    }

    let mut out = String::new();
    write_row(&mut out, &[headers[0].to_string(), headers[1].to_string()], &widths);
    for row in rows {
        write_row(&mut out, row, &widths);
    }
    out
}

fn write_row(out: &mut String, cells: &[String; 2], widths: &[usize; 2]) {
    for (cell, width) in cells.iter().zip(widths) {
        out.push_str(&format!("{cell:<width$}", width = width));
        out.push_str(COLUMN_GAP);
    }
    out.push('\n');
}
