// Copyright 2024 tison <wander4096@gmail.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::Path;

use laser_protos::Status;

/// The bulk file transport a base snapshot travels over. The wire itself is
/// external; the engine only needs "ship this directory to that URL" and the
/// follower-side URL for a staging directory.
pub trait SnapshotTransport: Send + Sync {
    /// Blocking send of every file under `src_dir` to `url`.
    fn send(&self, url: &str, src_dir: &Path) -> Result<(), Status>;

    /// The URL a follower hands to the leader so the transfer lands in
    /// `staging_dir`.
    fn receive_target(&self, staging_dir: &Path) -> Result<String, Status>;
}

/// Filesystem transport: `file://` URLs, plain directory copy. Stands in for
/// the production bulk transport and carries the whole test matrix.
#[derive(Debug, Default)]
pub struct FsSnapshotTransport;

const FILE_SCHEME: &str = "file://";

impl SnapshotTransport for FsSnapshotTransport {
    fn send(&self, url: &str, src_dir: &Path) -> Result<(), Status> {
        let Some(dest) = url.strip_prefix(FILE_SCHEME) else {
            log::error!("unsupported snapshot transfer url: {url}");
            return Err(Status::InvalidArgument);
        };
        let dest = Path::new(dest);
        std::fs::create_dir_all(dest).map_err(|err| Status::from_io(&err))?;

        let entries = std::fs::read_dir(src_dir).map_err(|err| Status::from_io(&err))?;
        for entry in entries {
            let entry = entry.map_err(|err| Status::from_io(&err))?;
            let path = entry.path();
            if path.is_file() {
                let target = dest.join(entry.file_name());
                std::fs::copy(&path, &target).map_err(|err| {
                    log::error!(err:?; "failed to copy snapshot file: {}", path.display());
                    Status::from_io(&err)
                })?;
            }
        }
        Ok(())
    }

    fn receive_target(&self, staging_dir: &Path) -> Result<String, Status> {
        let absolute = if staging_dir.is_absolute() {
            staging_dir.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(|err| Status::from_io(&err))?
                .join(staging_dir)
        };
        Ok(format!("{FILE_SCHEME}{}", absolute.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_copies_directory_files() {
        let src = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("table-1.tab"), b"table").unwrap();
        std::fs::write(src.path().join("CURRENT"), b"table-1.tab\n").unwrap();

        let transport = FsSnapshotTransport;
        let url = transport.receive_target(dest.path()).unwrap();
        assert!(url.starts_with(FILE_SCHEME));
        transport.send(&url, src.path()).unwrap();

        assert_eq!(
            std::fs::read(dest.path().join("CURRENT")).unwrap(),
            b"table-1.tab\n"
        );
        assert_eq!(
            std::fs::read(dest.path().join("table-1.tab")).unwrap(),
            b"table"
        );
    }

    #[test]
    fn test_unsupported_scheme_is_rejected() {
        let src = tempfile::tempdir().unwrap();
        let transport = FsSnapshotTransport;
        assert_eq!(
            transport.send("wdt://host:1234/x", src.path()).unwrap_err(),
            Status::InvalidArgument
        );
    }
}
