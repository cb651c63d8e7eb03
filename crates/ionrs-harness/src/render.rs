//! Plain-text rendering of heap reports.

use ionrs_core::{Device, HeapReport};

/// Render one heap's usage as a fixed-width table.
#[must_use]
pub fn render_plain(report: &HeapReport) -> String {
    use std::fmt::Write as _;

    let mut out = String::new();

    let w_client: usize = 16;
    let w_pid: usize = 8;
    let w_num: usize = 12;

    writeln!(
        out,
        "heap {} (id {}): used {} bytes, deferred {} bytes",
        report.heap_name, report.heap_id, report.used, report.deferred_bytes
    )
    .ok();
    writeln!(
        out,
        "{:<w_client$} {:>w_pid$} {:>w_num$} {:>w_num$} {:>w_num$}",
        "client", "pid", "size", "shared", "pss"
    )
    .ok();
    writeln!(out, "{}", "-".repeat(w_client + w_pid + 3 * w_num + 4)).ok();

    for usage in &report.clients {
        let pid = usage
            .pid
            .map_or_else(|| "kernel".to_string(), |p| p.to_string());
        writeln!(
            out,
            "{:<w_client$} {:>w_pid$} {:>w_num$} {:>w_num$} {:>w_num$}",
            usage.name, pid, usage.totals.size, usage.totals.shared, usage.totals.pss
        )
        .ok();
    }

    if !report.orphaned.is_empty() {
        writeln!(out, "orphaned:").ok();
        for orphan in &report.orphaned {
            let owner = orphan.last_owner.as_ref().map_or_else(
                || "unknown".to_string(),
                |o| match o.pid {
                    Some(pid) => format!("{} ({pid})", o.name),
                    None => o.name.clone(),
                },
            );
            writeln!(
                out,
                "  {:<10} {:>w_num$} bytes  refs {}  last owner {owner}",
                orphan.buffer.to_string(),
                orphan.size,
                orphan.ref_count
            )
            .ok();
        }
    }

    writeln!(
        out,
        "total {} bytes, shared {} bytes, orphaned {} bytes",
        report.total_size, report.total_shared, report.total_orphaned
    )
    .ok();
    out
}

/// Render every registered heap, in allocation order.
#[must_use]
pub fn render_device(device: &Device) -> String {
    device
        .heaps()
        .iter()
        .filter_map(|heap| device.heap_report(heap.id()).ok())
        .map(|report| render_plain(&report))
        .collect::<Vec<_>>()
        .join("\n")
}
