//! Image resolution.
//!
//! An explicit image id always wins. Otherwise the image is looked up by
//! name: the lookup format, owner organisation and base OS each fall back
//! from the machine template to the cluster spec to the built-in default.
//! Clusters with a managed control plane read the recommended image from
//! the provider's parameter store instead, unless one of the three lookup
//! settings is given.

use cloud_client::{CloudClientTrait, Filter, Image};
use crds::{AWSClusterSpec, EksAmiLookupType, InstanceTemplate};
use tracing::debug;

use crate::error::{CloudResultExt, ControllerError};

/// Default image name format
pub const DEFAULT_IMAGE_LOOKUP_FORMAT: &str = "capa-ami-{{.BaseOS}}-?{{.K8sVersion}}-*";
/// Default image owner
pub const DEFAULT_IMAGE_LOOKUP_ORG: &str = "258751437250";
/// Default base OS
pub const DEFAULT_IMAGE_LOOKUP_BASE_OS: &str = "ubuntu-18.04";

/// Owner and name pattern of the bastion image
pub const BASTION_IMAGE_OWNER: &str = "099720109477";
/// Name pattern of the bastion image
pub const BASTION_IMAGE_NAME: &str = "ubuntu/images/hvm-ssd/ubuntu-focal-20.04-amd64-server-*";

/// Image name pattern for a format, base OS and Kubernetes version.
///
/// The leading `v` of the version is dropped; the default format re-admits
/// it through its `?` wildcard.
#[must_use]
pub fn lookup_name(format: &str, base_os: &str, version: &str) -> String {
    format
        .replace("{{.BaseOS}}", base_os)
        .replace("{{.K8sVersion}}", version.trim_start_matches('v'))
}

/// Parameter store key of the recommended managed-node image
#[must_use]
pub fn managed_image_parameter(version: &str, lookup_type: Option<EksAmiLookupType>) -> String {
    let minor: Vec<&str> = version.trim_start_matches('v').split('.').take(2).collect();
    let flavour = match lookup_type {
        Some(EksAmiLookupType::AmazonLinuxGPU) => "amazon-linux-2-gpu",
        Some(EksAmiLookupType::AmazonLinux) | None => "amazon-linux-2",
    };
    format!(
        "/aws/service/eks/optimized-ami/{}/{flavour}/recommended/image_id",
        minor.join(".")
    )
}

/// Image id for an instance template
pub async fn resolve_image_id(
    client: &dyn CloudClientTrait,
    template: &InstanceTemplate,
    cluster: &AWSClusterSpec,
    version: Option<&str>,
    managed_control_plane: bool,
) -> Result<String, ControllerError> {
    if let Some(id) = template.ami.id.as_deref().filter(|id| !id.is_empty()) {
        return Ok(id.to_string());
    }

    let version = version.filter(|v| !v.is_empty()).ok_or_else(|| {
        ControllerError::InvalidConfig("either an image id or a version is required to select an image".to_string())
    })?;

    let format = template
        .image_lookup_format
        .as_deref()
        .or(cluster.image_lookup_format.as_deref());
    let org = template.image_lookup_org.as_deref().or(cluster.image_lookup_org.as_deref());
    let base_os = template
        .image_lookup_base_os
        .as_deref()
        .or(cluster.image_lookup_base_os.as_deref());

    if managed_control_plane && format.is_none() && org.is_none() && base_os.is_none() {
        let parameter = managed_image_parameter(version, template.ami.eks_optimized_lookup_type);
        debug!("Looking up managed image through parameter {}", parameter);
        return match client.get_parameter(&parameter).await {
            Ok(id) => Ok(id),
            Err(e) if e.is_not_found() => Err(ControllerError::ImageNotFound(format!("parameter {parameter} not set"))),
            Err(e) => Err(e).with_operation(|| format!("get parameter {parameter}")),
        };
    }

    let format = format.unwrap_or(DEFAULT_IMAGE_LOOKUP_FORMAT);
    let org = org.unwrap_or(DEFAULT_IMAGE_LOOKUP_ORG);
    let base_os = base_os.unwrap_or(DEFAULT_IMAGE_LOOKUP_BASE_OS);

    newest_image(client, &lookup_name(format, base_os, version), org).await
}

/// Id of the newest image named like `name` owned by `owner`
pub async fn newest_image(client: &dyn CloudClientTrait, name: &str, owner: &str) -> Result<String, ControllerError> {
    let filters = [Filter::new("owner-id", [owner]), Filter::new("name", [name])];
    let images = client
        .describe_images(&filters)
        .await
        .with_operation(|| format!("describe images named {name}"))?;
    images
        .into_iter()
        .max_by(|a, b| a.creation_date.cmp(&b.creation_date))
        .map(|image| image.image_id)
        .ok_or_else(|| ControllerError::ImageNotFound(format!("no image named {name} owned by {owner}")))
}

/// Image details, used for the root volume checks
pub async fn describe_image(client: &dyn CloudClientTrait, image_id: &str) -> Result<Image, ControllerError> {
    client
        .describe_images(&[Filter::new("image-id", [image_id])])
        .await
        .with_operation(|| format!("describe image {image_id}"))?
        .into_iter()
        .next()
        .ok_or_else(|| ControllerError::ImageNotFound(image_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloud_client::MockCloudClient;
    use crds::AmiReference;

    fn image(id: &str, name: &str, created: &str) -> Image {
        Image {
            image_id: id.to_string(),
            name: name.to_string(),
            owner_id: DEFAULT_IMAGE_LOOKUP_ORG.to_string(),
            creation_date: created.to_string(),
            root_device_name: Some("/dev/sda1".to_string()),
            root_snapshot_size: Some(8),
        }
    }

    #[test]
    fn test_lookup_name() {
        assert_eq!(
            lookup_name(DEFAULT_IMAGE_LOOKUP_FORMAT, "ubuntu-18.04", "v1.29.0"),
            "capa-ami-ubuntu-18.04-?1.29.0-*"
        );
    }

    #[test]
    fn test_managed_image_parameter() {
        assert_eq!(
            managed_image_parameter("v1.29.3", None),
            "/aws/service/eks/optimized-ami/1.29/amazon-linux-2/recommended/image_id"
        );
        assert_eq!(
            managed_image_parameter("1.28.1", Some(EksAmiLookupType::AmazonLinuxGPU)),
            "/aws/service/eks/optimized-ami/1.28/amazon-linux-2-gpu/recommended/image_id"
        );
    }

    #[tokio::test]
    async fn test_explicit_id_wins() {
        let cloud = MockCloudClient::default();
        let template = InstanceTemplate {
            ami: AmiReference {
                id: Some("ami-explicit".to_string()),
                eks_optimized_lookup_type: None,
            },
            ..Default::default()
        };
        let id = resolve_image_id(&cloud, &template, &AWSClusterSpec::default(), None, false)
            .await
            .unwrap();
        assert_eq!(id, "ami-explicit");
    }

    #[tokio::test]
    async fn test_lookup_picks_newest() {
        let cloud = MockCloudClient::default();
        cloud.add_image(image("ami-old", "capa-ami-ubuntu-18.04-v1.29.0-100", "2024-01-01T00:00:00Z"));
        cloud.add_image(image("ami-new", "capa-ami-ubuntu-18.04-v1.29.0-200", "2024-06-01T00:00:00Z"));
        cloud.add_image(image("ami-other", "capa-ami-ubuntu-18.04-v1.28.0-300", "2024-09-01T00:00:00Z"));

        let id = resolve_image_id(&cloud, &InstanceTemplate::default(), &AWSClusterSpec::default(), Some("v1.29.0"), false)
            .await
            .unwrap();
        assert_eq!(id, "ami-new");
    }

    #[tokio::test]
    async fn test_cluster_level_base_os_used() {
        let cloud = MockCloudClient::default();
        cloud.add_image(image("ami-flatcar", "capa-ami-flatcar-stable-v1.29.0-1", "2024-01-01T00:00:00Z"));
        let cluster = AWSClusterSpec {
            image_lookup_base_os: Some("flatcar-stable".to_string()),
            ..Default::default()
        };
        let id = resolve_image_id(&cloud, &InstanceTemplate::default(), &cluster, Some("v1.29.0"), false)
            .await
            .unwrap();
        assert_eq!(id, "ami-flatcar");
    }

    #[tokio::test]
    async fn test_missing_version_is_invalid() {
        let cloud = MockCloudClient::default();
        let err = resolve_image_id(&cloud, &InstanceTemplate::default(), &AWSClusterSpec::default(), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_managed_control_plane_reads_parameter() {
        let cloud = MockCloudClient::default();
        cloud.set_parameter("/aws/service/eks/optimized-ami/1.29/amazon-linux-2/recommended/image_id", "ami-eks");
        let id = resolve_image_id(&cloud, &InstanceTemplate::default(), &AWSClusterSpec::default(), Some("v1.29.0"), true)
            .await
            .unwrap();
        assert_eq!(id, "ami-eks");

        let err = resolve_image_id(&cloud, &InstanceTemplate::default(), &AWSClusterSpec::default(), Some("v1.30.0"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::ImageNotFound(_)));
    }

    #[tokio::test]
    async fn test_managed_control_plane_honours_lookup_org() {
        let cloud = MockCloudClient::default();
        cloud.set_parameter("/aws/service/eks/optimized-ami/1.29/amazon-linux-2/recommended/image_id", "ami-eks");
        let mut custom = image("ami-custom", "capa-ami-ubuntu-18.04-v1.29.0-7", "2024-03-01T00:00:00Z");
        custom.owner_id = "123456789012".to_string();
        cloud.add_image(custom);

        let template = InstanceTemplate {
            image_lookup_org: Some("123456789012".to_string()),
            ..Default::default()
        };
        let id = resolve_image_id(&cloud, &template, &AWSClusterSpec::default(), Some("v1.29.0"), true)
            .await
            .unwrap();
        assert_eq!(id, "ami-custom");
    }
}
