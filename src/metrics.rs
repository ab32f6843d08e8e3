use prometheus::{
    opts, register_int_counter_vec_with_registry, Encoder, IntCounter, IntCounterVec, Registry,
};

const METRICS_NAMESPACE: &str = "courier";

fn namespaced(name: &str) -> String {
    format!("{}_{}", METRICS_NAMESPACE, name)
}

/// Metrics for one courier instance. Cheap to clone; every handle writes
/// to the same registry.
#[derive(Clone)]
pub struct CourierMetrics {
    registry: Registry,

    transaction_submissions: IntCounterVec,
    finalized_events: IntCounterVec,
    failed_events: IntCounterVec,
    tracking_exhausted: IntCounterVec,
    // includes a label for the error causing the retry, and a label for the type of call
    call_retries: IntCounterVec,
}

impl CourierMetrics {
    pub fn new(registry: Registry) -> eyre::Result<Self> {
        let transaction_submissions = register_int_counter_vec_with_registry!(
            opts!(
                namespaced("transaction_submissions"),
                "The number of transactions accepted by the chain node",
            ),
            &["chain",],
            registry.clone()
        )?;
        let finalized_events = register_int_counter_vec_with_registry!(
            opts!(
                namespaced("finalized_events"),
                "The number of tracked events that reached their confirmation target",
            ),
            &["chain",],
            registry.clone()
        )?;
        let failed_events = register_int_counter_vec_with_registry!(
            opts!(
                namespaced("failed_events"),
                "The number of tracked events whose transaction reverted",
            ),
            &["chain",],
            registry.clone()
        )?;
        let tracking_exhausted = register_int_counter_vec_with_registry!(
            opts!(
                namespaced("tracking_exhausted"),
                "The number of tracked events that ran out of tracking attempts",
            ),
            &["chain",],
            registry.clone()
        )?;
        let call_retries = register_int_counter_vec_with_registry!(
            opts!(
                namespaced("call_retries"),
                "The number of retried calls, by error and call type",
            ),
            &["chain", "error_type", "call_type",],
            registry.clone()
        )?;
        Ok(Self {
            registry,
            transaction_submissions,
            finalized_events,
            failed_events,
            tracking_exhausted,
            call_retries,
        })
    }

    pub fn transaction_submissions(&self, chain: &str) -> IntCounter {
        self.transaction_submissions.with_label_values(&[chain])
    }

    pub fn finalized_events(&self, chain: &str) -> IntCounter {
        self.finalized_events.with_label_values(&[chain])
    }

    pub fn failed_events(&self, chain: &str) -> IntCounter {
        self.failed_events.with_label_values(&[chain])
    }

    pub fn tracking_exhausted(&self, chain: &str) -> IntCounter {
        self.tracking_exhausted.with_label_values(&[chain])
    }

    pub fn call_retries(&self, error_type: &str, call_type: &str, chain: &str) -> IntCounter {
        self.call_retries
            .with_label_values(&[chain, error_type, call_type])
    }

    pub fn gather(&self) -> prometheus::Result<Vec<u8>> {
        let collected_metrics = self.registry.gather();
        let mut out_buf = Vec::with_capacity(1024 * 64);
        let encoder = prometheus::TextEncoder::new();
        encoder.encode(&collected_metrics, &mut out_buf)?;
        Ok(out_buf)
    }

    #[cfg(test)]
    pub fn dummy_instance() -> Self {
        let registry = Registry::new();
        let instance = Self::new(registry.clone());
        instance.unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_report_through_registry() {
        let metrics = CourierMetrics::dummy_instance();
        metrics.transaction_submissions("1").inc();
        metrics.call_retries("network", "submit", "1").inc();
        metrics.call_retries("network", "submit", "1").inc();

        let report = String::from_utf8(metrics.gather().unwrap()).unwrap();
        assert!(report.contains("courier_transaction_submissions{chain=\"1\"} 1"));
        assert!(report.contains(
            "courier_call_retries{call_type=\"submit\",chain=\"1\",error_type=\"network\"} 2"
        ));
    }
}
