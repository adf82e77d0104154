use std::collections::HashMap;
use std::fmt;

use rtcp::receiver_report::ReceiverReport;
use rtcp::reception_report::ReceptionReport;
use rtcp::sender_report::SenderReport;

/// A sender or receiver report as last seen for one SSRC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpReport {
    Sender(SenderReport),
    Receiver(ReceiverReport),
}

impl RtcpReport {
    pub fn ssrc(&self) -> u32 {
        match self {
            RtcpReport::Sender(sr) => sr.ssrc,
            RtcpReport::Receiver(rr) => rr.ssrc,
        }
    }

    pub fn reception_reports(&self) -> &[ReceptionReport] {
        match self {
            RtcpReport::Sender(sr) => &sr.reports,
            RtcpReport::Receiver(rr) => &rr.reports,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReportOrigin {
    Received,
    Sent,
}

pub type RtcpReportListener = Box<dyn Fn(ReportOrigin, &RtcpReport) + Send + Sync>;

/// Latest received and sent reports, keyed by the SSRC of their originator.
#[derive(Default)]
pub struct RtcpReports {
    received: HashMap<u32, RtcpReport>,
    sent: HashMap<u32, RtcpReport>,
    listeners: Vec<RtcpReportListener>,
}

impl fmt::Debug for RtcpReports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtcpReports")
            .field("received", &self.received.len())
            .field("sent", &self.sent.len())
            .finish()
    }
}

impl RtcpReports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&mut self, listener: RtcpReportListener) {
        self.listeners.push(listener);
    }

    pub fn report_received(&mut self, report: RtcpReport) {
        self.notify(ReportOrigin::Received, &report);
        self.received.insert(report.ssrc(), report);
    }

    pub fn report_sent(&mut self, report: RtcpReport) {
        self.notify(ReportOrigin::Sent, &report);
        self.sent.insert(report.ssrc(), report);
    }

    pub fn received(&self, ssrc: u32) -> Option<&RtcpReport> {
        self.received.get(&ssrc)
    }

    pub fn sent(&self, ssrc: u32) -> Option<&RtcpReport> {
        self.sent.get(&ssrc)
    }

    pub fn received_reports(&self) -> impl Iterator<Item = &RtcpReport> {
        self.received.values()
    }

    pub fn sent_reports(&self) -> impl Iterator<Item = &RtcpReport> {
        self.sent.values()
    }

    /// Forgets the reports of a source that left the session.
    pub fn remove(&mut self, ssrc: u32) {
        self.received.remove(&ssrc);
        self.sent.remove(&ssrc);
    }

    fn notify(&self, origin: ReportOrigin, report: &RtcpReport) {
        for listener in &self.listeners {
            listener(origin, report);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_rtcp_reports_keep_latest_per_ssrc() {
        let mut reports = RtcpReports::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        reports.add_listener(Box::new(move |origin, _| {
            if origin == ReportOrigin::Received {
                seen2.fetch_add(1, Ordering::SeqCst);
            }
        }));

        reports.report_received(RtcpReport::Sender(SenderReport {
            ssrc: 1,
            packet_count: 10,
            ..Default::default()
        }));
        reports.report_received(RtcpReport::Sender(SenderReport {
            ssrc: 1,
            packet_count: 20,
            ..Default::default()
        }));
        reports.report_sent(RtcpReport::Receiver(ReceiverReport {
            ssrc: 2,
            ..Default::default()
        }));

        assert_eq!(seen.load(Ordering::SeqCst), 2);
        match reports.received(1) {
            Some(RtcpReport::Sender(sr)) => assert_eq!(sr.packet_count, 20),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(reports.sent(2).map(RtcpReport::ssrc), Some(2));
        assert_eq!(reports.received_reports().count(), 1);

        reports.remove(1);
        assert!(reports.received(1).is_none());
    }
}
