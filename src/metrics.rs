use std::collections::HashSet;

use anyhow::Result;
use prometheus::{GaugeVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

const TUNNEL_LABELS: [&str; 4] = ["name", "server", "security", "sni"];
const CHECK_LABELS: [&str; 5] = ["name", "server", "security", "sni", "result"];

/// 标识一条隧道时间序列的标签集合
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LabelSet {
    pub name: String,
    pub server: String,
    pub security: String,
    pub sni: String,
}

impl LabelSet {
    pub fn values(&self) -> [&str; 4] {
        [
            self.name.as_str(),
            self.server.as_str(),
            self.security.as_str(),
            self.sni.as_str(),
        ]
    }

    pub fn check_values<'a>(&'a self, result: &'a str) -> [&'a str; 5] {
        [
            self.name.as_str(),
            self.server.as_str(),
            self.security.as_str(),
            self.sni.as_str(),
            result,
        ]
    }
}

/// 指标收集器 - 持有全部按隧道导出的指标族
///
/// 注册表由调用方构造后传入，便于测试各自持有隔离的注册表。
pub struct TunnelMetrics {
    registry: Registry,

    pub tunnel_up: GaugeVec,
    pub tunnel_latency: GaugeVec,
    pub tunnel_check_total: IntCounterVec,
    pub tunnel_last_success: GaugeVec,
    pub tunnel_http_status: GaugeVec,
    pub tunnel_init_errors: IntCounter,
}

impl TunnelMetrics {
    pub fn new(registry: Registry) -> Result<Self> {
        let tunnel_up = GaugeVec::new(
            Opts::new("xray_tunnel_up", "1 if tunnel is working, 0 otherwise"),
            &TUNNEL_LABELS,
        )?;
        registry.register(Box::new(tunnel_up.clone()))?;

        let tunnel_latency = GaugeVec::new(
            Opts::new(
                "xray_tunnel_latency_seconds",
                "Latency of the tunnel check in seconds",
            ),
            &TUNNEL_LABELS,
        )?;
        registry.register(Box::new(tunnel_latency.clone()))?;

        let tunnel_check_total = IntCounterVec::new(
            Opts::new(
                "xray_tunnel_check_total",
                "Total number of tunnel checks by result",
            ),
            &CHECK_LABELS,
        )?;
        registry.register(Box::new(tunnel_check_total.clone()))?;

        let tunnel_last_success = GaugeVec::new(
            Opts::new(
                "xray_tunnel_last_success_timestamp",
                "Timestamp of last successful tunnel check",
            ),
            &TUNNEL_LABELS,
        )?;
        registry.register(Box::new(tunnel_last_success.clone()))?;

        let tunnel_http_status = GaugeVec::new(
            Opts::new(
                "xray_tunnel_http_status",
                "HTTP status code from tunnel check",
            ),
            &TUNNEL_LABELS,
        )?;
        registry.register(Box::new(tunnel_http_status.clone()))?;

        let tunnel_init_errors = IntCounter::new(
            "xray_tunnel_init_errors_total",
            "Total number of tunnel initialization errors",
        )?;
        registry.register(Box::new(tunnel_init_errors.clone()))?;

        Ok(Self {
            registry,
            tunnel_up,
            tunnel_latency,
            tunnel_check_total,
            tunnel_last_success,
            tunnel_http_status,
            tunnel_init_errors,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// 导出 Prometheus 文本格式（含 HELP/TYPE 注释行）
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .map_err(|e| anyhow::anyhow!("failed to encode metrics: {e}"))
    }

    /// 删除旧集合中存在而新集合中不存在的隧道的全部时间序列
    ///
    /// check counter 的 success/failure 两个变体一并删除；保留下来的
    /// 标签集不受影响，计数历史得以延续。
    pub fn cleanup_removed(&self, old: &[LabelSet], new: &[LabelSet]) {
        if old.is_empty() {
            return;
        }

        let kept: HashSet<&LabelSet> = new.iter().collect();

        for labels in old {
            if kept.contains(labels) {
                continue;
            }

            let values = labels.values();
            let _ = self.tunnel_up.remove_label_values(&values);
            let _ = self.tunnel_latency.remove_label_values(&values);
            let _ = self.tunnel_last_success.remove_label_values(&values);
            let _ = self.tunnel_http_status.remove_label_values(&values);
            let _ = self
                .tunnel_check_total
                .remove_label_values(&labels.check_values("success"));
            let _ = self
                .tunnel_check_total
                .remove_label_values(&labels.check_values("failure"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::series_value;

    fn label_set(name: &str, server: &str) -> LabelSet {
        LabelSet {
            name: name.to_string(),
            server: server.to_string(),
            security: "reality".to_string(),
            sni: "cdn.example.com".to_string(),
        }
    }

    fn populate(m: &TunnelMetrics, ls: &LabelSet) {
        let values = ls.values();
        m.tunnel_up.with_label_values(&values).set(1.0);
        m.tunnel_latency.with_label_values(&values).set(0.25);
        m.tunnel_last_success.with_label_values(&values).set(1.0);
        m.tunnel_http_status.with_label_values(&values).set(200.0);
        m.tunnel_check_total
            .with_label_values(&ls.check_values("success"))
            .inc();
        m.tunnel_check_total
            .with_label_values(&ls.check_values("failure"))
            .inc();
    }

    #[test]
    fn encode_includes_help_and_type_lines() {
        let metrics = TunnelMetrics::new(Registry::new()).unwrap();
        populate(&metrics, &label_set("t1", "vpn.example.com:443"));

        let text = metrics.encode().unwrap();
        assert!(text.contains("# HELP xray_tunnel_up"));
        assert!(text.contains("# TYPE xray_tunnel_up gauge"));
        assert!(text.contains("# TYPE xray_tunnel_check_total counter"));
        assert!(text.contains("name=\"t1\""));
    }

    #[test]
    fn cleanup_removed_deletes_every_family_for_removed_sets() {
        let metrics = TunnelMetrics::new(Registry::new()).unwrap();
        let a = label_set("a", "a.example.com:443");
        let b = label_set("b", "b.example.com:443");
        populate(&metrics, &a);
        populate(&metrics, &b);

        metrics.cleanup_removed(&[a.clone(), b.clone()], &[b.clone()]);

        let a_labels = [("name", "a"), ("server", "a.example.com:443")];
        for family in [
            "xray_tunnel_up",
            "xray_tunnel_latency_seconds",
            "xray_tunnel_last_success_timestamp",
            "xray_tunnel_http_status",
            "xray_tunnel_check_total",
        ] {
            assert!(
                series_value(&metrics, family, &a_labels).is_none(),
                "{family} should have no series for removed label set"
            );
        }

        // 保留的隧道连同其计数历史一起保留
        let b_success = [
            ("name", "b"),
            ("server", "b.example.com:443"),
            ("result", "success"),
        ];
        assert_eq!(series_value(&metrics, "xray_tunnel_check_total", &b_success), Some(1.0));
        assert_eq!(
            series_value(&metrics, "xray_tunnel_up", &[("name", "b")]),
            Some(1.0)
        );
    }

    #[test]
    fn cleanup_with_identical_sets_is_a_noop() {
        let metrics = TunnelMetrics::new(Registry::new()).unwrap();
        let a = label_set("a", "a.example.com:443");
        populate(&metrics, &a);

        metrics.cleanup_removed(&[a.clone()], &[a.clone()]);

        assert_eq!(
            series_value(&metrics, "xray_tunnel_up", &[("name", "a")]),
            Some(1.0)
        );
    }

    #[test]
    fn init_errors_counter_is_global() {
        let metrics = TunnelMetrics::new(Registry::new()).unwrap();
        metrics.tunnel_init_errors.inc();
        metrics.tunnel_init_errors.inc();
        assert_eq!(metrics.tunnel_init_errors.get(), 2);
    }
}
