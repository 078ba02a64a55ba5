// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fs;
use std::thread;

use serde_json::{json, Value};
use sysinfo::{System, Users, MINIMUM_CPU_UPDATE_INTERVAL};

use super::CollectResult;
use crate::diagnostics::Diagnostics;

fn thread_count(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Threads:"))
        .and_then(|count| count.trim().parse().ok())
}

/// Every process with its owner, memory share and CPU usage over a short
/// sampling window.
pub fn processes(_: &mut Diagnostics) -> CollectResult {
    let mut system = System::new_all();
    thread::sleep(MINIMUM_CPU_UPDATE_INTERVAL);
    system.refresh_all();
    let users = Users::new_with_refreshed_list();
    let total_memory = system.total_memory();

    let mut processes: Vec<Value> = system
        .processes()
        .iter()
        .map(|(pid, process)| {
            let username = process
                .user_id()
                .and_then(|uid| users.get_user_by_id(uid))
                .map(|user| user.name().to_string());
            let memory_percent = if total_memory == 0 {
                0.0
            } else {
                process.memory() as f64 * 100.0 / total_memory as f64
            };
            let num_threads = fs::read_to_string(format!("/proc/{pid}/status"))
                .ok()
                .and_then(|status| thread_count(&status));
            json!({
                "pid": pid.as_u32(),
                "ppid": process.parent().map(|parent| parent.as_u32()),
                "name": process.name().to_string_lossy(),
                "username": username,
                "memory_percent": memory_percent,
                "cpu_percent": process.cpu_usage(),
                "run_time": process.run_time(),
                "num_threads": num_threads,
                "status": process.status().to_string(),
            })
        })
        .collect();
    processes.sort_by_key(|p| p["pid"].as_u64());
    Ok(Value::Array(processes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_thread_count() {
        let status = "Name:\tbash\nState:\tS (sleeping)\nThreads:\t4\nVmRSS:\t100 kB\n";
        assert_eq!(thread_count(status), Some(4));
        assert_eq!(thread_count("Name:\tbash\n"), None);
    }

    #[test]
    fn lists_the_current_process() {
        let value = processes(&mut Diagnostics::new()).expect("process table is readable");
        let own = std::process::id();
        assert!(value
            .as_array()
            .into_iter()
            .flatten()
            .any(|p| p["pid"].as_u64() == Some(u64::from(own))));
    }
}
