// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

/// Prefix shared by every Service annotation the controller understands
pub const OPTION_PREFIX: &str = "cloudlb.io/";

/// Service annotation keys (the option table lives in `translate::options`)
pub mod options {
    pub const KIND: &str = "cloudlb.io/kind";
    pub const SCHEME: &str = "cloudlb.io/scheme";
    pub const SUBNETS: &str = "cloudlb.io/subnets";
    pub const EXTRA_SECURITY_GROUPS: &str = "cloudlb.io/extra-security-groups";
    pub const TARGET_TYPE: &str = "cloudlb.io/target-type";
    pub const IDLE_TIMEOUT: &str = "cloudlb.io/idle-timeout";
    pub const PROXY_PROTOCOL: &str = "cloudlb.io/proxy-protocol";
    pub const CROSS_ZONE: &str = "cloudlb.io/cross-zone";
    pub const HC_PROTOCOL: &str = "cloudlb.io/healthcheck-protocol";
    pub const HC_PORT: &str = "cloudlb.io/healthcheck-port";
    pub const HC_PATH: &str = "cloudlb.io/healthcheck-path";
    pub const HC_INTERVAL: &str = "cloudlb.io/healthcheck-interval";
    pub const HC_TIMEOUT: &str = "cloudlb.io/healthcheck-timeout";
    pub const HC_HEALTHY_THRESHOLD: &str = "cloudlb.io/healthcheck-healthy-threshold";
    pub const HC_UNHEALTHY_THRESHOLD: &str = "cloudlb.io/healthcheck-unhealthy-threshold";
    pub const ADDITIONAL_TAGS: &str = "cloudlb.io/additional-tags";
}

/// Tag keys stamped on every cloud resource the controller creates
pub mod tags {
    /// Prefix of the per-cluster ownership tag (`kubernetes.io/cluster/<name>=owned`)
    pub const CLUSTER_PREFIX: &str = "kubernetes.io/cluster/";
    pub const CLUSTER_OWNED: &str = "owned";
    /// UID of the owning Service; the primary recovery key after a restart
    pub const SERVICE_UID: &str = "cloudlb.io/service-uid";
    /// `<namespace>/<name>` of the owning Service, informational
    pub const SERVICE_NAME: &str = "cloudlb.io/service";
}

/// Kubernetes identifiers
pub mod kubernetes {
    /// Deletion guard placed on every Service we provision cloud resources for
    pub const FINALIZER: &str = "cloudlb.io/load-balancer-cleanup";
    /// Label linking an EndpointSlice to its Service
    pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";
    /// Nodes carrying this label never receive load-balancer traffic
    pub const EXCLUDE_FROM_LB_LABEL: &str = "node.kubernetes.io/exclude-from-external-load-balancers";
    pub const LOAD_BALANCER_TYPE: &str = "LoadBalancer";
}

/// The operator name used for events and field management
pub const OPERATOR_NAME: &str = "cloudlb-controller";

/// Path checked by the health check when the Service uses the Local traffic policy
pub const LOCAL_HEALTH_CHECK_PATH: &str = "/healthz";
