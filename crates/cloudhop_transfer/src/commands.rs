//! Shell command renderers for disk image manipulation on gateways and
//! compute hosts.

use serde::{Deserialize, Serialize};

pub fn backing_file_query(path: &str) -> String {
    format!("qemu-img info {path} | grep \"backing file\"")
}

/// Extracts the backing file path from `qemu-img info` output.
pub fn parse_backing_file(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim() != "backing file" {
            return None;
        }
        let value = value.trim();
        let value = value
            .split_once(" (actual path:")
            .map(|(path, _)| path)
            .unwrap_or(value);
        (!value.is_empty()).then(|| value.to_string())
    })
}

pub fn rebase(base: &str, disk: &str) -> String {
    format!("qemu-img rebase -u -b {base} {disk}")
}

pub fn commit(workdir: &str) -> String {
    format!("cd {workdir} && qemu-img commit disk")
}

pub fn convert_base_to_raw(workdir: &str, disk_format: &str) -> String {
    format!(
        "cd {workdir} && qemu-img convert -f {disk_format} -O raw baseimage baseimage.tmp && mv -f baseimage.tmp baseimage"
    )
}

pub fn convert_into_store(workdir: &str, pool: &str, image: &str) -> String {
    format!("qemu-img convert -p -O raw {workdir}/disk rbd:{pool}/{image}")
}

pub fn remove_store_image(pool: &str, image: &str) -> String {
    format!("rbd rm -p {pool} {image}")
}

pub fn remove_path(path: &str) -> String {
    format!("rm -rf {path}")
}

pub fn fresh_dir(path: &str) -> String {
    format!("rm -rf {path} && mkdir -p {path}")
}

/// Credentials for the image CLI available on the destination gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageCli {
    pub auth_url: String,
    pub user: String,
    pub password: String,
    pub tenant: String,
    #[serde(default = "default_convert_to_raw")]
    pub convert_to_raw: bool,
}

fn default_convert_to_raw() -> bool {
    true
}

impl ImageCli {
    fn base(&self) -> String {
        format!(
            "glance --os-username={} --os-password={} --os-tenant-name={} --os-auth-url={}",
            self.user, self.password, self.tenant, self.auth_url
        )
    }

    pub fn download(&self, image_id: &str, dest_file: &str) -> String {
        format!("{} image-download {image_id} > {dest_file}", self.base())
    }

    pub fn upload(&self, name: &str, disk_format: &str, file: &str) -> String {
        format!(
            "{} image-create --name {name} --disk-format={disk_format} --container-format=bare --file {file} | grep id",
            self.base()
        )
    }

    /// Reads the new image id out of the `| id | <value> |` table row.
    pub fn parse_created_id(output: &str) -> Option<String> {
        output.lines().find_map(|line| {
            let mut cells = line.split('|').map(str::trim).filter(|cell| !cell.is_empty());
            match (cells.next(), cells.next()) {
                (Some("id"), Some(value)) => Some(value.to_string()),
                _ => None,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_backing_file, ImageCli};

    #[test]
    fn reads_backing_file_with_or_without_actual_path() {
        assert_eq!(
            parse_backing_file("backing file: /var/lib/nova/instances/_base/abc"),
            Some("/var/lib/nova/instances/_base/abc".to_string())
        );
        assert_eq!(
            parse_backing_file(
                "image: disk.local\nbacking file: _base/eph (actual path: /var/lib/nova/instances/_base/eph)"
            ),
            Some("_base/eph".to_string())
        );
        assert_eq!(parse_backing_file("image: disk\nvirtual size: 1G"), None);
    }

    #[test]
    fn created_image_id_comes_from_id_row() {
        let output = "| checksum | abc |\n| id       | 5f1c-aa |\n| virtual_size | None |";
        assert_eq!(ImageCli::parse_created_id(output), Some("5f1c-aa".to_string()));
        assert_eq!(ImageCli::parse_created_id("| name | x |"), None);
    }
}
