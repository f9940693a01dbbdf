#![deny(clippy::unwrap_used)]

use std::io::Write;
use std::sync::Arc;

use dotenv::dotenv;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use device_shell::remote::client::parse_address;
use device_shell::remote::config::resolve_iproxy_path;
use device_shell::remote::forward::IproxyFactory;
use device_shell::remote::{
    ConnectionType, CredentialVault, DeviceConnector, DeviceIdentity, PortForwardManager,
    RusshConnector, SessionConfig, TunnelConfig,
};

const USAGE: &str = "usage: device-shell <udid|host[:port]> [username]";

/// A target containing `.` or `:` is a network address, anything else a UDID.
fn parse_target(target: &str) -> Result<DeviceIdentity, String> {
    if target.contains('.') || target.contains(':') {
        let (host, port) = parse_address(target)?;
        Ok(DeviceIdentity::network(host, port))
    } else {
        Ok(DeviceIdentity::usb(target))
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_prompt(prompt: &str) {
    print!("{}", prompt);
    let _ = std::io::stdout().flush();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    init_tracing();

    let mut args = std::env::args().skip(1);
    let Some(target) = args.next() else {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    };
    let device = parse_target(&target)?;

    let mut vault = match CredentialVault::open_default() {
        Ok(vault) => Some(vault),
        Err(e) => {
            warn!("Credential vault unavailable: {}", e);
            None
        }
    };
    let stored = vault
        .as_mut()
        .and_then(|vault| vault.get_credential(&device.id));

    let username = args
        .next()
        .or_else(|| stored.as_ref().map(|r| r.credential.username.clone()))
        .unwrap_or_else(|| "mobile".to_string());
    let password = std::env::var("SSH_PASSWORD")
        .ok()
        .or_else(|| {
            stored
                .as_ref()
                .filter(|r| r.credential.username == username)
                .map(|r| r.credential.password.clone())
        })
        .unwrap_or_else(|| "alpine".to_string());

    let proxies = Arc::new(PortForwardManager::new(
        Arc::new(IproxyFactory::new(resolve_iproxy_path(None))),
        TunnelConfig::from_env(),
    ));
    let devices = DeviceConnector::new(
        proxies.clone(),
        Arc::new(RusshConnector::new()),
        SessionConfig::from_env(),
    );

    let mut session = match devices.connect(&device, &username, &password).await {
        Ok(session) => session,
        Err(e) => {
            eprintln!("{}", e);
            proxies.cleanup_all().await;
            std::process::exit(1);
        }
    };

    if let Some(vault) = vault.as_mut() {
        let device_name = stored
            .as_ref()
            .map(|r| r.credential.device_name.clone())
            .unwrap_or_default();
        match session.credential(&device_name).await {
            Some(credential) if vault.save_credential(&device.id, credential.clone()) => {}
            _ => warn!("Could not remember credentials for {}", device.id),
        }
    }

    if device.connection_type == ConnectionType::Usb
        && let Some(port) = proxies.get_device_port(&device.id).await
    {
        info!("USB tunnel for {} on 127.0.0.1:{}", device.id, port);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    print_prompt(&session.shell().get_prompt());

    while let Some(line) = lines.next_line().await? {
        let shell = session.shell();

        if let Some(partial) = line.strip_suffix('\t') {
            for candidate in shell.get_completions(partial).await {
                println!("{}", candidate);
            }
            print_prompt(&shell.get_prompt());
            continue;
        }

        match line.trim() {
            "exit" | "logout" => break,
            "history" => {
                for (i, entry) in shell.history().enumerate() {
                    println!("{:>5}  {}", i + 1, entry);
                }
            }
            _ => {
                let output = shell.execute(&line).await;
                if line.trim() == "clear" && output.internal {
                    print!("\x1b[2J\x1b[H");
                }
                if !output.stdout.is_empty() {
                    print!("{}", output.stdout);
                    if !output.stdout.ends_with('\n') {
                        println!();
                    }
                }
                if !output.stderr.is_empty() {
                    eprint!("{}", output.stderr);
                    if !output.stderr.ends_with('\n') {
                        eprintln!();
                    }
                }
            }
        }

        print_prompt(&session.shell().get_prompt());
    }

    session.disconnect().await;
    proxies.cleanup_all().await;
    Ok(())
}
