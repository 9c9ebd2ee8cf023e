// VirtualMachine command set
//
// Version is fetched right after attach for diagnostics; Dispose is the
// orderly way to let go of a debuggee that should keep running.

use crate::commands::{command_sets, vm_commands};
use crate::connection::JdwpConnection;
use crate::protocol::{CommandPacket, JdwpResult};
use crate::reader::{read_i32, read_string};
use serde::{Deserialize, Serialize};

/// JVM version information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmVersion {
    pub description: String,
    pub jdwp_major: i32,
    pub jdwp_minor: i32,
    pub vm_version: String,
    pub vm_name: String,
}

impl JdwpConnection {
    /// VirtualMachine.Version
    pub async fn get_version(&self) -> JdwpResult<VmVersion> {
        let packet = CommandPacket::new(
            self.next_id(),
            command_sets::VIRTUAL_MACHINE,
            vm_commands::VERSION,
        );

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();

        Ok(VmVersion {
            description: read_string(&mut data)?,
            jdwp_major: read_i32(&mut data)?,
            jdwp_minor: read_i32(&mut data)?,
            vm_version: read_string(&mut data)?,
            vm_name: read_string(&mut data)?,
        })
    }

    /// VirtualMachine.Dispose: drop all debugger state in the VM and resume
    /// it, then close our side of the socket.
    pub async fn dispose(&self) -> JdwpResult<()> {
        let packet = CommandPacket::new(
            self.next_id(),
            command_sets::VIRTUAL_MACHINE,
            vm_commands::DISPOSE,
        );

        let result = self
            .send_command(packet)
            .await
            .and_then(|reply| reply.check_error());
        self.shutdown();
        result
    }
}
