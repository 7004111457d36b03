//! Command handlers for memcached protocol commands

use super::Server;
use crate::StorageError;
use crate::cache::{DeleteResponse, StoreResponse};
use crate::protocol::{Command, ResponseWriter, StoreVerb};
use crate::storage::{CacheElement, Key, current_timestamp, resolve_expiry};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Execute a parsed command
pub fn execute(server: &Arc<Server>, cmd: Command<'_>, response: &mut ResponseWriter) {
    server.metrics.record_command(cmd.name());

    match cmd {
        Command::Get { keys, with_cas } => handle_get(server, &keys, with_cas, response),
        Command::Store {
            verb,
            key,
            flags,
            exptime,
            data,
            cas_unique,
            ..
        } => {
            let element = CacheElement::new(Key::copy_from_slice(&key), flags, exptime, data.into_owned());
            handle_store(server, verb, element, cas_unique, response);
        }
        Command::Delete { key, hold, .. } => {
            match server.cache.delete(&Key::copy_from_slice(&key), hold) {
                Ok(DeleteResponse::Deleted) => response.deleted(),
                Ok(DeleteResponse::NotFound) => response.not_found(),
                Err(e) => storage_error(server, &e, response),
            }
        }
        Command::Incr { key, delta, .. } => {
            handle_arithmetic(server, &key, i64::try_from(delta).unwrap_or(i64::MAX), response);
        }
        Command::Decr { key, delta, .. } => {
            handle_arithmetic(server, &key, i64::try_from(delta).map_or(-i64::MAX, |d| -d), response);
        }
        Command::FlushAll { delay, .. } => {
            handle_flush_all(server, delay);
            response.ok();
        }
        Command::Stats { arg } => handle_stats(server, &arg, response),
        Command::Version => {
            response.version(concat!("arenacache ", env!("CARGO_PKG_VERSION")));
        }
        Command::Verbosity { .. } => response.ok(),
        Command::Quit => {
            // Handled in connection loop
        }
    }
}

fn storage_error(server: &Server, error: &StorageError, response: &mut ResponseWriter) {
    match error {
        StorageError::NotANumber => {
            response.client_error("cannot increment or decrement non-numeric value");
        }
        StorageError::OutOfSpace { .. } => {
            server.metrics.storage_errors.inc();
            response.server_error("out of memory storing object");
        }
        other => {
            server.metrics.storage_errors.inc();
            warn!("Storage error: {}", other);
            response.server_error(&other.to_string());
        }
    }
}

/// Handle GET/GETS command
fn handle_get(server: &Server, keys: &[Cow<'_, [u8]>], with_cas: bool, response: &mut ResponseWriter) {
    let keys: Vec<Key> = keys.iter().map(|k| Key::copy_from_slice(k)).collect();
    let found = match server.cache.get(&keys) {
        Ok(found) => found,
        Err(e) => return storage_error(server, &e, response),
    };

    server.metrics.get_hits.inc_by(found.len() as u64);
    server
        .metrics
        .get_misses
        .inc_by((keys.len() - found.len()) as u64);

    for element in &found {
        if with_cas {
            response.value_with_cas(element.key.as_bytes(), element.flags, &element.data, element.cas_unique);
        } else {
            response.value(element.key.as_bytes(), element.flags, &element.data);
        }
    }
    response.end();
}

/// Handle set/add/replace/append/prepend/cas
fn handle_store(
    server: &Server,
    verb: StoreVerb,
    element: CacheElement,
    cas_unique: u64,
    response: &mut ResponseWriter,
) {
    let cache = &server.cache;
    let result = match verb {
        StoreVerb::Set => cache.set(element),
        StoreVerb::Add => cache.add(element),
        StoreVerb::Replace => cache.replace(element),
        StoreVerb::Append => cache.append(element),
        StoreVerb::Prepend => cache.prepend(element),
        StoreVerb::Cas => cache.cas(element, cas_unique),
    };

    match result {
        Ok(StoreResponse::Stored) => response.stored(),
        Ok(StoreResponse::NotStored) => response.not_stored(),
        Ok(StoreResponse::Exists) => response.exists(),
        Ok(StoreResponse::NotFound) => response.not_found(),
        Err(e) => storage_error(server, &e, response),
    }
}

/// Handle INCR/DECR command
fn handle_arithmetic(server: &Server, key: &[u8], delta: i64, response: &mut ResponseWriter) {
    match server.cache.get_add(&Key::copy_from_slice(key), delta) {
        Ok(Some(value)) => response.number(value),
        Ok(None) => response.not_found(),
        Err(e) => storage_error(server, &e, response),
    }
}

/// Flush now, or schedule the flush `delay` seconds (or at absolute time) ahead
fn handle_flush_all(server: &Arc<Server>, delay: i64) {
    let now = current_timestamp();
    let wait = resolve_expiry(delay, now).map_or(0, |at| at - now);
    if wait <= 0 {
        server.cache.flush_all();
        return;
    }

    info!(seconds = wait, "Scheduling flush_all");
    let cache = Arc::clone(&server.cache);
    let cancel = server.cancel_token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(Duration::from_secs(wait as u64)) => cache.flush_all(),
        }
    });
}

/// Handle STATS command
fn handle_stats(server: &Server, arg: &[u8], response: &mut ResponseWriter) {
    let arg = String::from_utf8_lossy(arg);
    let mut stats = server.cache.stat(&arg);
    if arg.is_empty() {
        server.metrics.extend_stats(&mut stats);
    }
    for (name, values) in &stats {
        for value in values {
            response.stat(name, value);
        }
    }
    response.end();
}
