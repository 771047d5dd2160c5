mod api_automation;
mod api_pipeline;
mod postgres;
