//! The uniform device operation surface.
//!
//! [`RouterOps`] is one contract implemented by two variants --
//! [`LegacyRouter`] for the 6.x line and [`ModernRouter`] for 7.x. The
//! generations share almost every command verbatim, so the shared
//! operations live here as default methods running through the variant's
//! [`RouterSession`]; a variant overrides only what its firmware line does
//! differently, and generation-exclusive features (containers, WireGuard,
//! the `/routing/` tree) fail with [`CoreError::Capability`] on devices
//! that do not have them instead of sending a command the device would
//! not recognize.

mod legacy;
mod modern;
mod session;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use roswire_proto::{CommandStream, LoginScheme, Request, RowMap};

use crate::error::CoreError;

pub use legacy::LegacyRouter;
pub use modern::ModernRouter;
pub use session::RouterSession;

// ── Generation ───────────────────────────────────────────────────────

/// The device's firmware major line, decided once per device at first
/// successful connect and cached on its registry record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Generation {
    /// Not yet probed.
    Unknown,
    /// 6.x firmware line.
    Legacy,
    /// 7.x and later.
    Modern,
}

impl Generation {
    /// Classify a reported version string (`"7.14.2"`, `"6.49.10"`, ...).
    pub fn from_version(version: &str) -> Self {
        let major: Option<u32> = version
            .split(['.', ' '])
            .next()
            .and_then(|part| part.trim().parse().ok());
        match major {
            Some(m) if m >= 7 => Self::Modern,
            Some(_) => Self::Legacy,
            None => Self::Unknown,
        }
    }

    /// Which login handshake this generation expects. Unknown devices get
    /// the plain scheme -- its built-in downgrade covers the rest.
    pub fn login_scheme(self) -> LoginScheme {
        match self {
            Self::Legacy => LoginScheme::Challenge,
            Self::Modern | Self::Unknown => LoginScheme::Plain,
        }
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "unknown",
            Self::Legacy => "legacy",
            Self::Modern => "modern",
        })
    }
}

// ── RowStream ────────────────────────────────────────────────────────

/// Cancellable row sequence from a streaming command, with errors lifted
/// into the core taxonomy.
pub struct RowStream {
    inner: CommandStream,
}

impl RowStream {
    /// Next row; `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<Result<RowMap, CoreError>> {
        self.inner.next().await.map(|item| item.map_err(CoreError::from))
    }

    /// Stop the command on the device and release the exchange.
    pub async fn cancel(self) -> Result<(), CoreError> {
        self.inner.cancel().await.map_err(CoreError::from)
    }
}

impl fmt::Debug for RowStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

// ── RouterOps ────────────────────────────────────────────────────────

/// The uniform operation surface callers invoke without knowing the
/// device generation.
#[async_trait]
pub trait RouterOps: Send + Sync + fmt::Debug {
    /// The authenticated session this device talks through.
    fn session(&self) -> &RouterSession;

    /// The generation this implementation serves.
    fn generation(&self) -> Generation;

    /// Whether the underlying connection is still usable.
    fn is_connected(&self) -> bool {
        self.session().connection().is_connected()
    }

    /// Tear down the underlying connection.
    async fn close(&self) {
        self.session().connection().close().await;
    }

    // ── Raw passthrough ──────────────────────────────────────────────

    /// Run an arbitrary command with a verbatim parameter map.
    async fn raw_command(&self, path: &str, params: RowMap) -> Result<Vec<RowMap>, CoreError> {
        self.session().rows_map(path, &params).await
    }

    /// Start an arbitrary streaming command with a verbatim parameter map.
    async fn raw_stream(&self, path: &str, params: RowMap) -> Result<RowStream, CoreError> {
        let request = Request::new(path).params(&params);
        let inner = self.session().connection().stream(request).await?;
        Ok(RowStream { inner })
    }

    // ── System ───────────────────────────────────────────────────────

    /// CPU load, memory, uptime, version, board name.
    async fn system_resource(&self) -> Result<RowMap, CoreError> {
        self.session().first("/system/resource/print", &[]).await
    }

    async fn system_identity(&self) -> Result<String, CoreError> {
        let row = self.session().first("/system/identity/print", &[]).await?;
        Ok(row.get("name").cloned().unwrap_or_else(|| "unknown".to_string()))
    }

    /// Board, serial, and firmware details; empty on non-routerboard hardware.
    async fn system_routerboard(&self) -> Result<RowMap, CoreError> {
        self.session().first_tolerant("/system/routerboard/print", &[]).await
    }

    /// Voltage, temperature, fan speed; empty where unsupported.
    async fn system_health(&self) -> Result<RowMap, CoreError> {
        self.session().first_tolerant("/system/health/print", &[]).await
    }

    /// Reboot the device. The connection usually drops before the reply
    /// arrives, so both rejection and loss count as success here.
    async fn reboot(&self) -> Result<(), CoreError> {
        match self.session().exec("/system/reboot", &[]).await {
            Ok(()) | Err(CoreError::Device { .. } | CoreError::Connectivity { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ── Interfaces ───────────────────────────────────────────────────

    async fn interfaces(&self) -> Result<Vec<RowMap>, CoreError> {
        self.session().rows("/interface/print", &[]).await
    }

    async fn enable_interface(&self, name: &str) -> Result<(), CoreError> {
        self.session().exec("/interface/enable", &[("numbers", name)]).await
    }

    async fn disable_interface(&self, name: &str) -> Result<(), CoreError> {
        self.session().exec("/interface/disable", &[("numbers", name)]).await
    }

    /// One rx/tx rate snapshot for an interface.
    async fn interface_traffic(&self, name: &str) -> Result<RowMap, CoreError> {
        self.session()
            .first("/interface/monitor-traffic", &[("interface", name), ("once", "")])
            .await
    }

    async fn ethernet_stats(&self) -> Result<Vec<RowMap>, CoreError> {
        self.session().rows_tolerant("/interface/ethernet/print", &[]).await
    }

    // ── IP addressing ────────────────────────────────────────────────

    async fn ip_addresses(&self) -> Result<Vec<RowMap>, CoreError> {
        self.session().rows("/ip/address/print", &[]).await
    }

    /// Returns the `.id` of the created entry.
    async fn add_ip_address(&self, address: &str, interface: &str) -> Result<String, CoreError> {
        self.session()
            .create("/ip/address/add", &[("address", address), ("interface", interface)])
            .await
    }

    async fn remove_ip_address(&self, id: &str) -> Result<(), CoreError> {
        self.session().exec("/ip/address/remove", &[("numbers", id)]).await
    }

    async fn arp_entries(&self) -> Result<Vec<RowMap>, CoreError> {
        self.session().rows("/ip/arp/print", &[]).await
    }

    async fn ip_pools(&self) -> Result<Vec<RowMap>, CoreError> {
        self.session().rows("/ip/pool/print", &[]).await
    }

    async fn add_ip_pool(&self, name: &str, ranges: &str) -> Result<String, CoreError> {
        self.session().create("/ip/pool/add", &[("name", name), ("ranges", ranges)]).await
    }

    async fn remove_ip_pool(&self, id: &str) -> Result<(), CoreError> {
        self.session().exec("/ip/pool/remove", &[("numbers", id)]).await
    }

    // ── Firewall ─────────────────────────────────────────────────────

    async fn firewall_filter(&self) -> Result<Vec<RowMap>, CoreError> {
        self.session().rows("/ip/firewall/filter/print", &[]).await
    }

    /// Rule parameters pass through verbatim; their semantics belong to
    /// the device.
    async fn add_firewall_filter(&self, params: RowMap) -> Result<String, CoreError> {
        self.session().create_map("/ip/firewall/filter/add", &params).await
    }

    async fn remove_firewall_rule(&self, id: &str) -> Result<(), CoreError> {
        self.session().exec("/ip/firewall/filter/remove", &[("numbers", id)]).await
    }

    async fn enable_firewall_rule(&self, id: &str) -> Result<(), CoreError> {
        self.session().exec("/ip/firewall/filter/enable", &[("numbers", id)]).await
    }

    async fn disable_firewall_rule(&self, id: &str) -> Result<(), CoreError> {
        self.session().exec("/ip/firewall/filter/disable", &[("numbers", id)]).await
    }

    async fn move_firewall_rule(&self, id: &str, destination: u32) -> Result<(), CoreError> {
        self.session()
            .exec(
                "/ip/firewall/filter/move",
                &[("numbers", id), ("destination", &destination.to_string())],
            )
            .await
    }

    async fn firewall_nat(&self) -> Result<Vec<RowMap>, CoreError> {
        self.session().rows("/ip/firewall/nat/print", &[]).await
    }

    async fn add_firewall_nat(&self, params: RowMap) -> Result<String, CoreError> {
        self.session().create_map("/ip/firewall/nat/add", &params).await
    }

    async fn remove_firewall_nat(&self, id: &str) -> Result<(), CoreError> {
        self.session().exec("/ip/firewall/nat/remove", &[("numbers", id)]).await
    }

    async fn firewall_mangle(&self) -> Result<Vec<RowMap>, CoreError> {
        self.session().rows("/ip/firewall/mangle/print", &[]).await
    }

    async fn add_firewall_mangle(&self, params: RowMap) -> Result<String, CoreError> {
        self.session().create_map("/ip/firewall/mangle/add", &params).await
    }

    async fn remove_firewall_mangle(&self, id: &str) -> Result<(), CoreError> {
        self.session().exec("/ip/firewall/mangle/remove", &[("numbers", id)]).await
    }

    /// Address-list entries, optionally filtered to one list.
    async fn address_list(&self, list: Option<&str>) -> Result<Vec<RowMap>, CoreError> {
        let queries: Vec<String> = list.map(|l| format!("?list={l}")).into_iter().collect();
        self.session()
            .rows_query("/ip/firewall/address-list/print", &[], &queries)
            .await
    }

    async fn add_address_list_entry(
        &self,
        address: &str,
        list: &str,
        comment: Option<&str>,
    ) -> Result<String, CoreError> {
        let mut params = vec![("address", address), ("list", list)];
        if let Some(comment) = comment {
            params.push(("comment", comment));
        }
        self.session().create("/ip/firewall/address-list/add", &params).await
    }

    async fn remove_address_list_entry(&self, id: &str) -> Result<(), CoreError> {
        self.session()
            .exec("/ip/firewall/address-list/remove", &[("numbers", id)])
            .await
    }

    async fn connection_tracking(&self) -> Result<Vec<RowMap>, CoreError> {
        self.session().rows("/ip/firewall/connection/print", &[]).await
    }

    // ── DHCP ─────────────────────────────────────────────────────────

    async fn dhcp_servers(&self) -> Result<Vec<RowMap>, CoreError> {
        self.session().rows("/ip/dhcp-server/print", &[]).await
    }

    async fn dhcp_leases(&self) -> Result<Vec<RowMap>, CoreError> {
        self.session().rows("/ip/dhcp-server/lease/print", &[]).await
    }

    async fn add_dhcp_static_lease(
        &self,
        mac: &str,
        address: &str,
        comment: Option<&str>,
    ) -> Result<String, CoreError> {
        let mut params = vec![("mac-address", mac), ("address", address), ("type", "static")];
        if let Some(comment) = comment {
            params.push(("comment", comment));
        }
        self.session().create("/ip/dhcp-server/lease/add", &params).await
    }

    async fn remove_dhcp_lease(&self, id: &str) -> Result<(), CoreError> {
        self.session().exec("/ip/dhcp-server/lease/remove", &[("numbers", id)]).await
    }

    async fn make_dhcp_lease_static(&self, id: &str) -> Result<(), CoreError> {
        self.session()
            .exec("/ip/dhcp-server/lease/make-static", &[("numbers", id)])
            .await
    }

    // ── Wireless ─────────────────────────────────────────────────────

    async fn wireless_interfaces(&self) -> Result<Vec<RowMap>, CoreError> {
        self.session().rows_tolerant("/interface/wireless/print", &[]).await
    }

    /// Currently associated wireless clients.
    async fn wireless_registrations(&self) -> Result<Vec<RowMap>, CoreError> {
        self.session()
            .rows_tolerant("/interface/wireless/registration-table/print", &[])
            .await
    }

    async fn enable_wireless(&self, interface: &str) -> Result<(), CoreError> {
        self.session().exec("/interface/wireless/enable", &[("numbers", interface)]).await
    }

    async fn disable_wireless(&self, interface: &str) -> Result<(), CoreError> {
        self.session()
            .exec("/interface/wireless/disable", &[("numbers", interface)])
            .await
    }

    /// Kick one client off the radio.
    async fn deauthenticate_wireless(&self, mac: &str) -> Result<(), CoreError> {
        self.session()
            .exec("/interface/wireless/deauthenticate", &[("mac-address", mac)])
            .await
    }

    // ── DNS ──────────────────────────────────────────────────────────

    async fn dns_settings(&self) -> Result<RowMap, CoreError> {
        self.session().first("/ip/dns/print", &[]).await
    }

    async fn set_dns_servers(&self, servers: &[String]) -> Result<(), CoreError> {
        self.session()
            .exec("/ip/dns/set", &[("servers", &servers.join(","))])
            .await
    }

    async fn dns_cache(&self) -> Result<Vec<RowMap>, CoreError> {
        self.session().rows("/ip/dns/cache/print", &[]).await
    }

    async fn flush_dns_cache(&self) -> Result<(), CoreError> {
        self.session().exec("/ip/dns/cache/flush", &[]).await
    }

    // ── NTP ──────────────────────────────────────────────────────────

    async fn ntp_client(&self) -> Result<RowMap, CoreError> {
        self.session().first("/system/ntp/client/print", &[]).await
    }

    async fn set_ntp_servers(&self, primary: &str, secondary: Option<&str>) -> Result<(), CoreError> {
        let mut params = vec![("enabled", "yes"), ("primary-ntp", primary)];
        if let Some(secondary) = secondary {
            params.push(("secondary-ntp", secondary));
        }
        self.session().exec("/system/ntp/client/set", &params).await
    }

    // ── Users ────────────────────────────────────────────────────────

    async fn users(&self) -> Result<Vec<RowMap>, CoreError> {
        self.session().rows("/user/print", &[]).await
    }

    async fn add_user(&self, name: &str, password: &str, group: &str) -> Result<String, CoreError> {
        self.session()
            .create("/user/add", &[("name", name), ("password", password), ("group", group)])
            .await
    }

    async fn remove_user(&self, id: &str) -> Result<(), CoreError> {
        self.session().exec("/user/remove", &[("numbers", id)]).await
    }

    // ── PPP / VPN ────────────────────────────────────────────────────

    async fn ppp_secrets(&self) -> Result<Vec<RowMap>, CoreError> {
        self.session().rows("/ppp/secret/print", &[]).await
    }

    async fn add_ppp_secret(
        &self,
        name: &str,
        password: &str,
        service: &str,
        profile: &str,
    ) -> Result<String, CoreError> {
        self.session()
            .create(
                "/ppp/secret/add",
                &[("name", name), ("password", password), ("service", service), ("profile", profile)],
            )
            .await
    }

    async fn remove_ppp_secret(&self, id: &str) -> Result<(), CoreError> {
        self.session().exec("/ppp/secret/remove", &[("numbers", id)]).await
    }

    /// Currently established PPP sessions.
    async fn ppp_active(&self) -> Result<Vec<RowMap>, CoreError> {
        self.session().rows_tolerant("/ppp/active/print", &[]).await
    }

    // ── Queues ───────────────────────────────────────────────────────

    async fn simple_queues(&self) -> Result<Vec<RowMap>, CoreError> {
        self.session().rows("/queue/simple/print", &[]).await
    }

    async fn add_simple_queue(
        &self,
        name: &str,
        target: &str,
        max_limit: &str,
        comment: Option<&str>,
    ) -> Result<String, CoreError> {
        let mut params = vec![("name", name), ("target", target), ("max-limit", max_limit)];
        if let Some(comment) = comment {
            params.push(("comment", comment));
        }
        self.session().create("/queue/simple/add", &params).await
    }

    async fn remove_simple_queue(&self, id: &str) -> Result<(), CoreError> {
        self.session().exec("/queue/simple/remove", &[("numbers", id)]).await
    }

    async fn enable_simple_queue(&self, id: &str) -> Result<(), CoreError> {
        self.session().exec("/queue/simple/enable", &[("numbers", id)]).await
    }

    async fn disable_simple_queue(&self, id: &str) -> Result<(), CoreError> {
        self.session().exec("/queue/simple/disable", &[("numbers", id)]).await
    }

    // ── Scripts ──────────────────────────────────────────────────────

    async fn scripts(&self) -> Result<Vec<RowMap>, CoreError> {
        self.session().rows_tolerant("/system/script/print", &[]).await
    }

    async fn run_script(&self, name: &str) -> Result<(), CoreError> {
        self.session().exec("/system/script/run", &[("number", name)]).await
    }

    // ── Logs ─────────────────────────────────────────────────────────

    /// The most recent log entries, optionally filtered by topics.
    async fn recent_logs(&self, limit: usize, topics: Option<&str>) -> Result<Vec<RowMap>, CoreError> {
        let queries: Vec<String> = topics.map(|t| format!("?topics={t}")).into_iter().collect();
        let mut rows = self.session().rows_query("/log/print", &[], &queries).await?;
        if rows.len() > limit {
            rows.drain(..rows.len() - limit);
        }
        Ok(rows)
    }

    /// Follow the log in real time until the stream is cancelled.
    async fn follow_logs(&self, topics: Option<&str>) -> Result<RowStream, CoreError> {
        let mut request = Request::new("/log/print").param("follow", "");
        if let Some(topics) = topics {
            request = request.param("topics", topics);
        }
        let inner = self.session().connection().stream(request).await?;
        Ok(RowStream { inner })
    }

    // ── Routing ──────────────────────────────────────────────────────

    async fn routes(&self) -> Result<Vec<RowMap>, CoreError> {
        self.session().rows("/ip/route/print", &[]).await
    }

    async fn add_route(&self, dst_address: &str, gateway: &str, distance: u32) -> Result<String, CoreError> {
        self.session()
            .create(
                "/ip/route/add",
                &[("dst-address", dst_address), ("gateway", gateway), ("distance", &distance.to_string())],
            )
            .await
    }

    async fn remove_route(&self, id: &str) -> Result<(), CoreError> {
        self.session().exec("/ip/route/remove", &[("numbers", id)]).await
    }

    // ── Tools ────────────────────────────────────────────────────────

    async fn ping(&self, address: &str, count: u32) -> Result<Vec<RowMap>, CoreError> {
        self.session()
            .rows("/ping", &[("address", address), ("count", &count.to_string())])
            .await
    }

    async fn traceroute(&self, address: &str) -> Result<Vec<RowMap>, CoreError> {
        self.session()
            .rows("/tool/traceroute", &[("address", address), ("count", "3")])
            .await
    }

    // ── Files / backup / export ──────────────────────────────────────

    async fn files(&self) -> Result<Vec<RowMap>, CoreError> {
        self.session().rows("/file/print", &[]).await
    }

    async fn delete_file(&self, name: &str) -> Result<(), CoreError> {
        self.session().exec("/file/remove", &[("numbers", name)]).await
    }

    /// Trigger a configuration backup and return the resulting filename.
    async fn create_backup(&self, name: Option<&str>, password: Option<&str>) -> Result<String, CoreError> {
        let mut params = Vec::new();
        if let Some(name) = name {
            params.push(("name", name));
        }
        if let Some(password) = password {
            params.push(("password", password));
        }
        self.session().exec("/system/backup/save", &params).await?;

        // the device does not echo the filename; find the newest .backup
        let files = self.session().rows_tolerant("/file/print", &[]).await?;
        let found = files
            .iter()
            .filter_map(|f| f.get("name"))
            .filter(|n| n.ends_with(".backup"))
            .next_back()
            .cloned();
        Ok(found.unwrap_or_else(|| format!("{}.backup", name.unwrap_or("backup"))))
    }

    /// Full configuration export as script text.
    async fn export_config(&self) -> Result<String, CoreError> {
        let rows = self.session().rows("/export", &[]).await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get("ret"))
            .cloned()
            .collect::<Vec<_>>()
            .join("\n"))
    }

    // ── Modern-generation exclusives ─────────────────────────────────
    //
    // Default to a capability error; the modern variant overrides them.

    /// Container workloads (modern generation only).
    async fn containers(&self) -> Result<Vec<RowMap>, CoreError> {
        Err(self.capability_error("container management"))
    }

    async fn start_container(&self, id: &str) -> Result<(), CoreError> {
        let _ = id;
        Err(self.capability_error("container management"))
    }

    async fn stop_container(&self, id: &str) -> Result<(), CoreError> {
        let _ = id;
        Err(self.capability_error("container management"))
    }

    /// WireGuard tunnels (modern generation only).
    async fn wireguard_interfaces(&self) -> Result<Vec<RowMap>, CoreError> {
        Err(self.capability_error("WireGuard"))
    }

    async fn wireguard_peers(&self) -> Result<Vec<RowMap>, CoreError> {
        Err(self.capability_error("WireGuard"))
    }

    /// BGP sessions from the unified routing tree (modern generation only).
    async fn bgp_sessions(&self) -> Result<Vec<RowMap>, CoreError> {
        Err(self.capability_error("BGP status"))
    }

    /// OSPF instances from the unified routing tree (modern generation only).
    async fn ospf_instances(&self) -> Result<Vec<RowMap>, CoreError> {
        Err(self.capability_error("OSPF status"))
    }

    /// IPv6 addressing (modern generation only).
    async fn ipv6_addresses(&self) -> Result<Vec<RowMap>, CoreError> {
        Err(self.capability_error("IPv6 addressing"))
    }

    /// Build the error every generation-exclusive default returns.
    fn capability_error(&self, operation: &str) -> CoreError {
        CoreError::Capability {
            operation: operation.to_string(),
            generation: self.generation(),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
