//! `metrics::install()` sets the process-wide Prometheus recorder and
//! panics if called a second time (`PrometheusBuilder::install_recorder`
//! only ever succeeds once per process), so every test in this binary that
//! wants metrics recording enabled has to share a single installation
//! rather than each calling `install()` itself. `lazy_static` gives that
//! one-time, thread-safe initialization the same way the upstream e2e
//! suite uses it for its `SERIAL_GUARD`.

use lazy_static::lazy_static;
use metrics_exporter_prometheus::PrometheusHandle;

lazy_static! {
    static ref RECORDER: PrometheusHandle = kroxide::metrics::install();
}

#[test]
fn recording_every_call_site_after_install_does_not_panic() {
    let _handle = &*RECORDER;
    kroxide::metrics::record_frame("downstream_in", 0, true);
    kroxide::metrics::record_filter_dispatch("broker-address", "forward", 0.001);
    kroxide::metrics::record_kms_call("generate_dek_pair", "ok", 0.01);
    kroxide::metrics::record_dek_rotation("k");
    kroxide::metrics::record_decrypt_cache(true);
}

#[test]
fn rendering_the_handle_includes_recorded_series() {
    let handle = &*RECORDER;
    kroxide::metrics::record_frame("upstream_out", 1, false);
    let rendered = handle.render();
    assert!(rendered.contains("kroxide_frames_total"));
}
