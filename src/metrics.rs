use prometheus::{opts, Encoder, IntCounter, IntCounterVec, Registry, TextEncoder};

#[derive(Clone)]
pub struct FallbackMetrics {
    registry: Registry,
    failovers_total: IntCounterVec,
    exhaustions_total: IntCounter,
    output_refusals_total: IntCounterVec,
    selection_resets_total: IntCounter,
    requests_total: IntCounterVec,
}

impl FallbackMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let failovers_total = IntCounterVec::new(
            opts!(
                "fallback_failovers_total",
                "Retryable backend failures that moved selection to the next backend"
            ),
            &["backend"],
        )?;
        let exhaustions_total = IntCounter::with_opts(opts!(
            "fallback_exhaustions_total",
            "Calls that failed on every configured backend"
        ))?;
        let output_refusals_total = IntCounterVec::new(
            opts!(
                "fallback_output_refusals_total",
                "Mid-stream failures not retried because output was already forwarded"
            ),
            &["backend"],
        )?;
        let selection_resets_total = IntCounter::with_opts(opts!(
            "fallback_selection_resets_total",
            "Periodic resets of the selection back to the primary backend"
        ))?;
        let requests_total = IntCounterVec::new(
            opts!("gateway_requests_total", "Chat requests by mode and status"),
            &["stream", "status"],
        )?;

        registry.register(Box::new(failovers_total.clone()))?;
        registry.register(Box::new(exhaustions_total.clone()))?;
        registry.register(Box::new(output_refusals_total.clone()))?;
        registry.register(Box::new(selection_resets_total.clone()))?;
        registry.register(Box::new(requests_total.clone()))?;

        Ok(Self {
            registry,
            failovers_total,
            exhaustions_total,
            output_refusals_total,
            selection_resets_total,
            requests_total,
        })
    }

    pub fn observe_failover(&self, backend: &str) {
        self.failovers_total.with_label_values(&[backend]).inc();
    }

    pub fn observe_exhaustion(&self) {
        self.exhaustions_total.inc();
    }

    pub fn observe_output_refusal(&self, backend: &str) {
        self.output_refusals_total
            .with_label_values(&[backend])
            .inc();
    }

    pub fn observe_selection_reset(&self) {
        self.selection_resets_total.inc();
    }

    pub fn observe_request(&self, stream: bool, status: u16) {
        let stream_label = if stream { "true" } else { "false" };
        self.requests_total
            .with_label_values(&[stream_label, &status.to_string()])
            .inc();
    }

    pub fn render(&self) -> Result<String, String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|error| error.to_string())?;
        String::from_utf8(buffer).map_err(|error| error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_render_with_labels() {
        let metrics = FallbackMetrics::new().expect("metrics register");
        metrics.observe_failover("model1");
        metrics.observe_failover("model1");
        metrics.observe_output_refusal("model2");
        metrics.observe_exhaustion();
        metrics.observe_request(true, 200);

        let rendered = metrics.render().expect("metrics render");
        assert!(rendered.contains("fallback_failovers_total{backend=\"model1\"} 2"));
        assert!(rendered.contains("fallback_output_refusals_total{backend=\"model2\"} 1"));
        assert!(rendered.contains("fallback_exhaustions_total 1"));
        assert!(rendered.contains("fallback_selection_resets_total 0"));
        let request_line = rendered
            .lines()
            .find(|line| line.starts_with("gateway_requests_total{"))
            .expect("request counter rendered");
        assert!(request_line.contains("stream=\"true\""));
        assert!(request_line.contains("status=\"200\""));
        assert!(request_line.ends_with(" 1"));
    }
}
