use std::fmt;
use std::sync::Arc;

use triport_net::{Protocol, QueueLimits, Result};
use triport_softnic::bridge::map_hw_error;
use triport_softnic::{CmId, CompletionQueue, Device, ProtectionDomain, QpCaps, SoftNet};

use crate::config::VerbsConfig;
use crate::queue::VerbsQueue;

/// One opened device with its protection domain and the posting limits
/// every channel on it uses.
pub struct VerbsContext {
    net: Arc<SoftNet>,
    device: Arc<Device>,
    pd: Arc<ProtectionDomain>,
    limits: QueueLimits,
    config: VerbsConfig,
}

impl VerbsContext {
    pub fn open(net: Arc<SoftNet>, config: VerbsConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let device = Device::open(net.clone(), "softnic0", config.device);
        let attr = device.query();
        let pd = device.alloc_pd();
        let limits = QueueLimits {
            max_send_wr: config.max_send_wr.min(attr.max_qp_wr),
            max_recv_wr: config.max_recv_wr.min(attr.max_qp_wr),
            max_inline_data: config.max_inline_data.min(attr.max_inline_data),
            max_msg_iov: config.max_sge.min(attr.max_sge),
            max_rma_iov: config.max_sge.min(attr.max_sge),
            max_msg_sz: attr.max_msg_sz,
        };
        tracing::debug!(device = device.name(), ?limits, "opened verbs context");
        Ok(Arc::new(Self {
            net,
            device,
            pd,
            limits,
            config,
        }))
    }

    pub fn net(&self) -> &Arc<SoftNet> {
        &self.net
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn pd(&self) -> &Arc<ProtectionDomain> {
        &self.pd
    }

    pub fn limits(&self) -> QueueLimits {
        self.limits
    }

    pub fn config(&self) -> &VerbsConfig {
        &self.config
    }

    fn qp_caps(&self) -> QpCaps {
        QpCaps {
            max_send_wr: self.limits.max_send_wr,
            max_recv_wr: self.limits.max_recv_wr,
            max_send_sge: self.limits.max_msg_iov,
            max_recv_sge: self.limits.max_msg_iov,
            max_inline_data: self.limits.max_inline_data,
        }
    }

    /// Give `cm_id` a queue pair with its own completion queues and start a
    /// protocol session on it. The first eager receive is posted here, before
    /// the connection exists.
    pub(crate) fn create_session(&self, cm_id: &CmId) -> Result<Protocol<VerbsQueue>> {
        let send_cq = CompletionQueue::new(self.limits.max_send_wr, None);
        let recv_cq = CompletionQueue::new(self.limits.max_recv_wr, None);
        let qp = cm_id
            .create_qp(&self.pd, self.qp_caps(), send_cq, recv_cq)
            .map_err(|e| map_hw_error(e, "qp"))?;
        Protocol::new(VerbsQueue::new(qp, self.limits), self.config.protocol_config())
    }
}

impl fmt::Debug for VerbsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerbsContext")
            .field("device", &self.device)
            .field("limits", &self.limits)
            .finish()
    }
}
