// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Sends raw TPM 2.0 commands to a simulator, the TPM device, or the
//! platform resource manager, and prints the responses as hex.

use anyhow::Context;
use clap::Parser;
use clap::ValueEnum;
use std::num::NonZeroU32;
use std::path::PathBuf;
use tpm_comm::TpmComm;
use tpm_comm::TpmCommConfig;
use tpm_comm::device::TPM_DEVICE_PATH;
use tpm_comm::simulator::SimulatorConfig;
use tpm_comm::simulator::protocol::DEFAULT_COMMAND_PORT;
use tpm_comm::simulator::protocol::DEFAULT_HOST;

/// TPM2_GetRandom for 8 bytes.
const GET_RANDOM: &str = "80010000000c0000017b0008";

/// TPM2_Startup(TPM_SU_CLEAR).
const STARTUP_CLEAR: &str = "80010000000c000001440000";

/// Largest TPM 2.0 response buffer.
const MAX_RESPONSE: usize = 4096;

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Backend {
    /// TPM simulator over TCP.
    Emulator,
    /// Raw TPM character device.
    OsDevice,
    /// Platform TPM resource manager.
    OsResourceManager,
}

#[derive(Parser, Debug)]
#[clap(name = "tpm_comm_tool", about = "Send raw commands to a TPM.")]
struct CmdArgs {
    /// Enable verbose logging (trace level)
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Which TPM to talk to
    #[arg(short = 'b', long, value_enum, default_value = "emulator")]
    backend: Backend,

    /// Simulator host
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,

    /// Simulator command port
    #[arg(long, default_value_t = DEFAULT_COMMAND_PORT)]
    port: u16,

    /// Simulator platform port. Defaults to the command port plus one.
    #[arg(long)]
    platform_port: Option<u16>,

    /// Seconds to wait for each step of a simulator exchange
    #[arg(long, default_value = "20")]
    timeout: NonZeroU32,

    /// TPM device node for the os-device backend
    #[arg(long, default_value = TPM_DEVICE_PATH)]
    device: PathBuf,

    /// Send TPM2_Startup(CLEAR) before the command
    #[arg(long)]
    startup: bool,

    /// Command to send, as hex. Repeat to send several in order.
    #[arg(short = 'c', long = "command", default_value = GET_RANDOM)]
    commands: Vec<String>,
}

impl CmdArgs {
    fn config(&self) -> TpmCommConfig {
        match self.backend {
            Backend::Emulator => TpmCommConfig::Emulator(SimulatorConfig {
                host: self.host.clone(),
                command_port: self.port,
                platform_port: self.platform_port,
                timeout: self.timeout,
            }),
            Backend::OsDevice => TpmCommConfig::OsDevice(self.device.clone()),
            Backend::OsResourceManager => TpmCommConfig::OsResourceManager,
        }
    }
}

fn run_command(tpm: &mut dyn TpmComm, hex_command: &str) -> anyhow::Result<()> {
    let command = hex::decode(hex_command.trim())
        .with_context(|| format!("invalid hex command {hex_command:?}"))?;
    let mut response = vec![0; MAX_RESPONSE];
    let len = tpm
        .submit_command(&command, &mut response)
        .with_context(|| format!("command {hex_command} failed"))?;
    let response = &response[..len];

    if let Some(code) = response.get(6..10) {
        let code = u32::from_be_bytes(code.try_into()?);
        tracing::info!(len, code = %format!("{code:#x}"), "tpm response");
    }
    println!("{}", hex::encode(response));
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = CmdArgs::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .log_internal_errors(true)
        .with_env_filter(if args.verbose {
            tracing_subscriber::EnvFilter::new("trace")
        } else {
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        })
        .init();

    let mut tpm = tpm_comm::open(&args.config()).context("failed to open tpm")?;
    tracing::info!(kind = %tpm.kind(), "connected");

    if args.startup {
        run_command(&mut *tpm, STARTUP_CLEAR)?;
    }
    for command in &args.commands {
        run_command(&mut *tpm, command)?;
    }
    Ok(())
}
