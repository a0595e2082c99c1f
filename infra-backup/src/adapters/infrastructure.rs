//! Hypervisor and infrastructure state extraction.
//!
//! Each listed VM is archived with `vzdump` into a scratch bundle, state
//! trees (cluster config, network definitions) are added as `state.tar`, and
//! the bundle is tarred and fetched. VM archives are always complete; change
//! filtering only applies to the state trees.

use super::{find_and_tar_command, ExtractRequest, RawExtract, SourceAdapter};
use crate::error::{BackupError, Result};
use crate::exec::{with_remote_temp, ExecError, HostExec};
use crate::inventory::SourceSpec;
use crate::model::SourceKind;
use async_trait::async_trait;
use tracing::info;

pub struct InfrastructureAdapter;

#[async_trait]
impl SourceAdapter for InfrastructureAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Infrastructure
    }

    async fn extract(&self, exec: &dyn HostExec, req: &ExtractRequest<'_>) -> Result<RawExtract> {
        let SourceSpec::Infrastructure { vm_ids, paths } = req.source else {
            return Err(BackupError::Config(format!("{} is not an infrastructure source", req.host.name)));
        };

        let extract_timeout = req.timeouts.extract();
        let transfer_timeout = req.timeouts.transfer();
        let dest = req.dest.clone();
        let since = req.change_filter();

        let entity_count = with_remote_temp(exec, "ibk-infra", extract_timeout, &req.cancel, |tmp| async move {
            let bundle = format!("{tmp}/bundle");
            exec.run_checked(&format!("mkdir -p {bundle}"), extract_timeout).await?;

            let mut count = 0u64;
            for id in vm_ids {
                exec.run_checked(
                    &format!("vzdump {id} --dumpdir {bundle} --mode snapshot --compress 0"),
                    extract_timeout,
                )
                .await?;
                count += 1;
            }

            if !paths.is_empty() {
                let out = exec
                    .run_checked(
                        &find_and_tar_command(paths, &[], since, &format!("{tmp}/list"), &format!("{bundle}/state.tar")),
                        extract_timeout,
                    )
                    .await?;
                count += out.stdout.trim().parse::<u64>().unwrap_or(0);
            }

            let archive = format!("{tmp}/infra.tar");
            exec.run_checked(&format!("tar -C {bundle} -cf {archive} ."), extract_timeout)
                .await?;
            exec.fetch(&archive, &dest, transfer_timeout).await?;
            Ok::<_, ExecError>(count)
        })
        .await?;

        info!(host = %req.host.name, vms = vm_ids.len(), entities = entity_count, "Infrastructure extraction finished");
        Ok(RawExtract {
            path: req.dest.clone(),
            entity_count,
        })
    }
}
