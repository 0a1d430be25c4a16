//! Admin command surface.
//!
//! Synchronous text commands, one per line, read from the control socket.
//! Every reply is a single `ok …` or `error: …` line; mutations mark the
//! add-on dirty and flush immediately.

use crate::store;

use super::Server;

/// Result of one admin command.
#[derive(Debug)]
pub enum AdminOutcome {
    /// Reply line; the server keeps running.
    Handled(String),
    /// Reply line; the state loop shuts down afterwards.
    Shutdown(String),
}

fn ok(message: impl Into<String>) -> AdminOutcome {
    AdminOutcome::Handled(format!("ok {}", message.into()))
}

fn err(message: impl Into<String>) -> AdminOutcome {
    let message = message.into();
    tracing::error!("{message}");
    AdminOutcome::Handled(format!("error: {message}"))
}

pub fn handle_admin_command(server: &mut Server, line: &str) -> AdminOutcome {
    let line = line.trim();
    let mut parts = line.splitn(2, char::is_whitespace);
    let cmd = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or_default().trim();

    match cmd {
        "shut_down" => {
            tracing::info!("shut down requested by admin, shutting down");
            AdminOutcome::Shutdown("ok shutting down".to_string())
        }

        "readonly" => {
            if !rest.is_empty() {
                let value = matches!(rest, "true" | "yes" | "on" | "1");
                server.config.set_read_only(value);
                if let Err(e) = server.write_config() {
                    return err(format!("failed to persist read-only mode: {e}"));
                }
            }
            let state = if server.config.read_only { "enabled" } else { "disabled" };
            tracing::info!("read only mode: {state}");
            ok(format!("read only mode: {state}"))
        }

        "flush" => {
            tracing::info!("flushing config to disk");
            match server.write_config() {
                Ok(()) => ok("flushed"),
                Err(e) => err(format!("flush failed: {e}")),
            }
        }

        "reload" => match rest {
            "" => {
                tracing::info!("reloading all configuration");
                match server.reload() {
                    Ok(()) => {
                        tracing::info!("reloaded configuration");
                        ok("reloaded configuration")
                    }
                    Err(e) => err(format!("configuration reload failed: {e}")),
                }
            }
            "blacklist" => {
                tracing::info!("reloading blacklist");
                server.load_blacklist();
                ok("reloaded blacklist")
            }
            other => err(format!("unrecognized admin reload argument: {other}")),
        },

        "delete" => {
            if rest.is_empty() || rest.split_whitespace().count() != 1 {
                return err("incorrect number of arguments for 'delete'");
            }
            tracing::info!("deleting add-on '{rest}' requested from control socket");
            match server.delete_addon(rest) {
                Ok(true) => ok(format!("deleted add-on '{rest}'")),
                Ok(false) => err(format!("add-on '{rest}' not found, cannot delete")),
                Err(e) => err(format!("failed to delete add-on '{rest}': {e}")),
            }
        }

        "hide" | "unhide" => {
            if rest.is_empty() || rest.split_whitespace().count() != 1 {
                return err(format!("incorrect number of arguments for '{cmd}'"));
            }
            let hide = cmd == "hide";
            let Some(addon) = server.store.get_mut(rest) else {
                return err(format!("add-on '{rest}' not found, cannot {cmd}"));
            };
            addon.set_attr("hidden", if hide { "true" } else { "false" });
            server.store.mark_dirty(rest);
            if let Err(e) = server.write_config() {
                return err(format!("failed to persist hidden flag: {e}"));
            }
            let state = if hide { "hidden" } else { "unhidden" };
            tracing::info!("add-on '{rest}' is now {state}");
            ok(format!("add-on '{rest}' is now {state}"))
        }

        "setpass" => {
            let mut args = rest.splitn(2, char::is_whitespace);
            let (Some(id), Some(newpass)) = (args.next(), args.next()) else {
                return err("incorrect number of arguments for 'setpass'");
            };
            if newpass.is_empty() {
                return err("add-on passphrases may not be empty");
            }
            let Some(addon) = server.store.get_mut(id) else {
                return err(format!("add-on '{id}' not found, cannot set passphrase"));
            };
            store::set_passphrase(addon, newpass);
            let id = id.to_string();
            server.store.mark_dirty(&id);
            if let Err(e) = server.write_config() {
                return err(format!("failed to persist passphrase: {e}"));
            }
            tracing::info!("new passphrase set for '{id}'");
            ok(format!("new passphrase set for '{id}'"))
        }

        "setattr" => {
            let mut args = rest.splitn(3, char::is_whitespace);
            let (Some(id), Some(key), Some(value)) = (args.next(), args.next(), args.next())
            else {
                return err("incorrect number of arguments for 'setattr'");
            };
            if key == "name" || key == "version" {
                return err("setattr cannot be used to rename add-ons or change their version");
            }
            if key == "passphrase" || key == "passhash" || key == "passsalt" {
                return err("setattr cannot be used to set auth data, use setpass instead");
            }
            let Some(addon) = server.store.get_mut(id) else {
                return err(format!("add-on '{id}' not found, cannot set attribute"));
            };
            // Uploads set every recognized attribute, so an absent key is
            // not a recognized add-on attribute.
            if !addon.has_attr(key) {
                return err(format!("attribute '{key}' is not a recognized add-on attribute"));
            }
            addon.set_attr(key, value);
            let (id, key, value) = (id.to_string(), key.to_string(), value.to_string());
            server.store.mark_dirty(&id);
            if let Err(e) = server.write_config() {
                return err(format!("failed to persist attribute: {e}"));
            }
            tracing::info!("set attribute on add-on '{id}': {key}={value:?}");
            ok(format!("set {key} on add-on '{id}'"))
        }

        _ => err(format!("unrecognized admin command: {line}")),
    }
}
