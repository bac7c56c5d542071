//! Unit tests for CRD helpers and validation

mod machine_network {
    use crate::crd::{
        DnsConfig, Machine, MachineSpec, NetworkConfig, ProviderSpec, INITIALIZERS_ANNOTATION,
        IPAM_INITIALIZER,
    };
    use serde_json::json;
    use std::collections::BTreeMap;

    fn machine(value: serde_json::Value, initializers: Option<&str>) -> Machine {
        let mut m = Machine::new(
            "worker-0",
            MachineSpec {
                provider_spec: ProviderSpec { value },
                kubelet_version: Some("1.30.2".to_string()),
            },
        );
        m.metadata.namespace = Some("kube-system".to_string());
        if let Some(v) = initializers {
            m.metadata.annotations = Some(BTreeMap::from([(
                INITIALIZERS_ANNOTATION.to_string(),
                v.to_string(),
            )]));
        }
        m
    }

    #[test]
    fn test_network_absent() {
        let m = machine(json!({"cloudProvider": "vsphere"}), None);
        assert_eq!(m.network().unwrap(), None);
        let empty = machine(serde_json::Value::Null, None);
        assert_eq!(empty.network().unwrap(), None);
    }

    #[test]
    fn test_network_rejects_bad_shape() {
        let m = machine(json!({"network": "10.0.0.2/24"}), None);
        let err = m.network().unwrap_err();
        assert!(err.is_terminal());
    }

    #[test]
    fn test_set_network_keeps_provider_fields() {
        let mut m = machine(json!({"cloudProvider": "vsphere", "cpus": 2}), None);
        let network = NetworkConfig {
            cidr: "192.168.0.2/16".to_string(),
            gateway: "192.168.0.1".to_string(),
            dns: DnsConfig {
                servers: vec!["8.8.8.8".to_string()],
            },
        };
        m.set_network(&network).unwrap();
        assert_eq!(m.network().unwrap(), Some(network));
        assert_eq!(m.spec.provider_spec.value["cpus"], json!(2));
        assert_eq!(m.spec.provider_spec.value["network"]["dns"]["servers"][0], json!("8.8.8.8"));
    }

    #[test]
    fn test_initializer_removal() {
        let mut m = machine(json!({}), Some("ipam, bootstrap"));
        assert!(m.has_initializer(IPAM_INITIALIZER));
        m.remove_initializer(IPAM_INITIALIZER);
        assert!(!m.has_initializer(IPAM_INITIALIZER));
        assert!(m.has_initializer("bootstrap"));

        m.remove_initializer("bootstrap");
        let annotations = m.metadata.annotations.unwrap();
        assert!(!annotations.contains_key(INITIALIZERS_ANNOTATION));
    }
}

mod backup_storage_location {
    use crate::crd::{
        ClusterBackupStorageLocation, ClusterBackupStorageLocationSpec, ObjectStorageLocation,
        SecretKeySelector, SyncPhase,
    };

    fn spec() -> ClusterBackupStorageLocationSpec {
        ClusterBackupStorageLocationSpec {
            provider: "aws".to_string(),
            object_storage: ObjectStorageLocation {
                bucket: "fleet-backups".to_string(),
                prefix: Some("seeds".to_string()),
                ca_cert: None,
            },
            credential: Some(SecretKeySelector {
                name: "backup-credentials".to_string(),
                key: "cloud".to_string(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_spec() {
        assert!(spec().validate().is_ok());
    }

    #[test]
    fn test_empty_bucket_rejected() {
        let mut s = spec();
        s.object_storage.bucket = " ".to_string();
        assert!(s.validate().unwrap_err().to_string().contains("objectStorage.bucket"));
    }

    #[test]
    fn test_incomplete_credential_rejected() {
        let mut s = spec();
        s.credential = Some(SecretKeySelector {
            name: "backup-credentials".to_string(),
            key: String::new(),
        });
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_sync_phase_defaults_to_pending() {
        let cbsl = ClusterBackupStorageLocation::new("default", spec());
        assert_eq!(cbsl.sync_phase(), SyncPhase::Pending);
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let status = crate::crd::ClusterBackupStorageLocationStatus {
            sync_phase: Some(SyncPhase::PartiallyFailed),
            last_synced_time: Some("2024-01-01T00:00:00Z".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["syncPhase"], "PartiallyFailed");
        assert_eq!(json["lastSyncedTime"], "2024-01-01T00:00:00Z");
        assert!(json.get("conditions").is_none());
    }
}
