//! GPU utilization gauges, polled from `nvidia-smi`.

use std::time::Duration;

use metrics::gauge;

use crate::metric_names;

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const SMI_TIMEOUT: Duration = Duration::from_secs(2);

/// Spawn the background poller. Machines without `nvidia-smi` (development
/// laptops, CPU-only CI) simply never see the gauges move.
pub fn spawn_gpu_poller() {
    tokio::spawn(async move {
        loop {
            if let Some((util_pct, vram_mb)) = query_nvidia_smi().await {
                gauge!(metric_names::GPU_UTILIZATION).set(util_pct);
                gauge!(metric_names::GPU_VRAM_USED_MB).set(vram_mb);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    });
}

async fn query_nvidia_smi() -> Option<(f64, f64)> {
    let output = tokio::time::timeout(
        SMI_TIMEOUT,
        tokio::process::Command::new("nvidia-smi")
            .args([
                "--query-gpu=utilization.gpu,memory.used",
                "--format=csv,noheader,nounits",
            ])
            .output(),
    )
    .await
    .ok()?
    .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_smi_output(std::str::from_utf8(&output.stdout).ok()?)
}

fn parse_smi_output(stdout: &str) -> Option<(f64, f64)> {
    let line = stdout.lines().next()?;
    let mut parts = line.split(',').map(|p| p.trim());
    let util = parts.next()?.parse().ok()?;
    let vram = parts.next()?.parse().ok()?;
    Some((util, vram))
}

#[test]
fn test_parse_smi_output() {
    assert_eq!(parse_smi_output("37, 2048\n"), Some((37.0, 2048.0)));
    assert_eq!(parse_smi_output(""), None);
    assert_eq!(parse_smi_output("garbage"), None);
}
