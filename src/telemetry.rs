#[cfg(feature = "metrics")]
pub(crate) fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc(_name: &'static str) {}

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc_model(name: &'static str, model: &crate::types::ModelName) {
    metrics::increment_counter!(name, "model" => model.0.clone());
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc_model(_name: &'static str, _model: &crate::types::ModelName) {}
