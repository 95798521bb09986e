//! Pipeline assembly for one connection.
//!
//! # Responsibilities
//! - Pick the effective size limits for the listener
//! - Install the HTTP/1.1 chain (with the h2c upgrade stage on cleartext
//!   listeners) or the HTTP/2 chain; both carry the body size gate when
//!   request-size validation is on
//! - Record one assembly event per pipeline
//!
//! # Design Decisions
//! - The cleartext path always installs the full HTTP/1.1 chain next to the
//!   upgrade stage; a successful upgrade retires it by ending the h1 codec
//! - A listener's own `request_size` block overrides the process-wide one

use std::sync::Arc;

use crate::config::RequestSizeValidationConfiguration;
use crate::handler::SourceHandler;
use crate::http::adapter::SourceAdapter;
use crate::negotiation::h2c::UpgradeSlot;
use crate::negotiation::NegotiatedProtocol;
use crate::net::connection::ConnectionContext;
use crate::observability::metrics;
use crate::pipeline::decoder::read_buffer_cap;
use crate::pipeline::{
    BodyAggregator, ChunkWriter, Codec, Compressor, HeaderGate, Http1Settings, Http2Settings,
    Pipeline, PipelineBuilder, PipelineError, StageKind, UpgradeStage,
};
use crate::services::TransportServices;

/// Why a pipeline is being assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyPhase {
    /// Right after accept or TLS handshake.
    Initial,
    /// After an accepted h2c upgrade.
    Upgrade,
}

impl AssemblyPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssemblyPhase::Initial => "initial",
            AssemblyPhase::Upgrade => "upgrade",
        }
    }
}

#[derive(Clone)]
pub struct PipelineAssembler {
    services: Arc<TransportServices>,
    handler: Arc<dyn SourceHandler>,
}

impl PipelineAssembler {
    pub fn new(services: Arc<TransportServices>, handler: Arc<dyn SourceHandler>) -> Self {
        Self { services, handler }
    }

    pub fn services(&self) -> &Arc<TransportServices> {
        &self.services
    }

    fn size_limits(&self, ctx: &ConnectionContext) -> RequestSizeValidationConfiguration {
        ctx.listener.request_size.unwrap_or_else(|| self.services.request_size())
    }

    fn adapter(&self, kind: StageKind, ctx: &ConnectionContext, protocol: NegotiatedProtocol) -> SourceAdapter {
        SourceAdapter::new(
            kind,
            self.handler.clone(),
            self.services.downstream_queue().clone(),
            ctx,
            protocol,
        )
    }

    /// HTTP/1.1 chain: decoder → [http2-upgrade] → [custom-aggregator] →
    /// compressor → chunkWriter → handler.
    pub fn http1(
        &self,
        ctx: &ConnectionContext,
        protocol: NegotiatedProtocol,
        upgrade: Option<UpgradeSlot>,
    ) -> Result<Pipeline, PipelineError> {
        let limits = self.size_limits(ctx);
        let codec = Codec::Http1(Http1Settings {
            keep_alive: ctx.listener.keep_alive,
            max_buf_size: read_buffer_cap(&limits),
            header_read_timeout: ctx.listener.connect_timeout(),
        });

        let mut builder = PipelineBuilder::new(codec).add_last(HeaderGate::new(limits))?;
        if let Some(slot) = upgrade {
            builder = builder.add_last(UpgradeStage::new(slot))?;
        }
        let pipeline = builder
            .add_last_if(limits.request_size_validation, BodyAggregator::new(&limits))?
            .add_last(Compressor::new())?
            .add_last(ChunkWriter::new(self.services.output_content_buffer_size()))?
            .add_last(self.adapter(StageKind::Handler, ctx, protocol))?
            .build()?;

        self.assembled(ctx, protocol, AssemblyPhase::Initial, &pipeline);
        Ok(pipeline)
    }

    /// HTTP/2 chain: [custom-aggregator] → http2-handler. Header lists are
    /// bounded by the codec itself.
    pub fn http2(
        &self,
        ctx: &ConnectionContext,
        protocol: NegotiatedProtocol,
        phase: AssemblyPhase,
    ) -> Result<Pipeline, PipelineError> {
        let limits = self.size_limits(ctx);
        let max_header_list_size = limits
            .header_size_validation
            .then(|| u32::try_from(limits.max_header_size).unwrap_or(u32::MAX));

        let pipeline = PipelineBuilder::new(Codec::Http2(Http2Settings { max_header_list_size }))
            .add_last_if(
                limits.request_size_validation,
                BodyAggregator::new(&limits).for_http2(),
            )?
            .add_last(self.adapter(StageKind::Http2Handler, ctx, protocol))?
            .build()?;

        self.assembled(ctx, protocol, phase, &pipeline);
        Ok(pipeline)
    }

    fn assembled(
        &self,
        ctx: &ConnectionContext,
        protocol: NegotiatedProtocol,
        phase: AssemblyPhase,
        pipeline: &Pipeline,
    ) {
        tracing::debug!(
            connection_id = %ctx.id,
            listener_id = %ctx.listener.id,
            peer_addr = %ctx.remote_addr,
            protocol = protocol.as_str(),
            phase = phase.as_str(),
            stages = ?pipeline.names(),
            "Pipeline assembled"
        );
        metrics::record_pipeline(protocol, phase);
    }
}
