//! PowerShell text for every package-manager and restore-point interaction.
//! Nothing outside this module knows the AppX cmdlet syntax.

use appsweep_core::PolicyTweak;

pub(crate) const BATCH_START_SUFFIX: &str = "---START---";
pub(crate) const BATCH_END_MARKER: &str = "---END---";
pub(crate) const INSTALLED_TOKEN: &str = "INSTALLED";
pub(crate) const NOT_INSTALLED_TOKEN: &str = "NOT_INSTALLED";
pub(crate) const SERVICE_RUNNING_TOKEN: &str = "RUNNING";

const CHECKPOINT_SERVICE: &str = "VSS";
const RECENT_APPS_KEY: &str = r"HKCU:\Software\Microsoft\Windows\CurrentVersion\Search\RecentApps\*";
const PROGRAM_INVENTORY_LOG: &str = "Microsoft-Windows-Application-Experience/Program-Inventory";
const HKCR_PREFIX: &str = "HKCR:\\";
const HKCR_PROVIDER_PREFIX: &str = "Registry::HKEY_CLASSES_ROOT\\";

pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

const REGISTERED_FILTER: &str = "$_.PackageUserInformation.InstallState -contains 'Installed'";

/// Every payload with this exact name, including ones staged but registered
/// for no user.
fn exact_package(id: &str) -> String {
    format!(
        "Get-AppxPackage -AllUsers | Where-Object {{ $_.Name -eq {} }}",
        quote(id)
    )
}

/// Only payloads some user actually has installed.
fn registered_package(id: &str) -> String {
    format!(
        "Get-AppxPackage -AllUsers | Where-Object {{ $_.Name -eq {} -and ({REGISTERED_FILTER}) }}",
        quote(id)
    )
}

pub fn installed_query(id: &str) -> String {
    format!(
        "if ({}) {{ '{INSTALLED_TOKEN}' }} else {{ '{NOT_INSTALLED_TOKEN}' }}",
        registered_package(id)
    )
}

/// One process answers for every id. Output per id:
/// `<id>---START---`, `INSTALLED` or `NOT_INSTALLED`, `---END---`.
pub fn batch_installed_query(ids: &[String]) -> String {
    let list = ids.iter().map(|id| quote(id)).collect::<Vec<_>>().join(",");
    format!(
        "$installed = @{{}}; \
         Get-AppxPackage -AllUsers | Where-Object {{ {REGISTERED_FILTER} }} | ForEach-Object {{ $installed[$_.Name] = $true }}; \
         foreach ($id in @({list})) {{ \
         \"$($id){BATCH_START_SUFFIX}\"; \
         if ($installed.ContainsKey($id)) {{ '{INSTALLED_TOKEN}' }} else {{ '{NOT_INSTALLED_TOKEN}' }}; \
         '{BATCH_END_MARKER}' }}"
    )
}

pub fn remove_package(id: &str) -> String {
    format!("{} | Remove-AppxPackage -AllUsers", exact_package(id))
}

/// `HKCR:` is not a default PowerShell drive, so such keys are rewritten to the
/// registry provider path.
pub fn normalize_registry_path(target: &str) -> String {
    match target.get(..HKCR_PREFIX.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(HKCR_PREFIX) => {
            format!("{HKCR_PROVIDER_PREFIX}{}", &target[HKCR_PREFIX.len()..])
        }
        _ => target.to_string(),
    }
}

pub fn purge_cleanup_target(target: &str) -> String {
    let path = quote(&normalize_registry_path(target));
    format!("if (Test-Path -LiteralPath {path}) {{ Remove-Item -LiteralPath {path} -Recurse -Force }}")
}

pub fn reregister_package(id: &str) -> String {
    format!(
        "$pkg = {} | Select-Object -First 1; \
         if (-not $pkg) {{ throw 'no staged payload for {}' }}; \
         Add-AppxPackage -DisableDevelopmentMode -Register (Join-Path $pkg.InstallLocation 'AppXManifest.xml')",
        exact_package(id),
        id.replace('\'', "''")
    )
}

pub fn reprovision_package(id: &str) -> String {
    format!(
        "$prov = Get-AppxProvisionedPackage -Online | Where-Object {{ $_.DisplayName -eq {} }} | Select-Object -First 1; \
         if (-not $prov) {{ throw 'no provisioned payload for {}' }}; \
         Add-AppxProvisionedPackage -Online -PackagePath $prov.PackagePath -SkipLicense | Out-Null",
        quote(id),
        id.replace('\'', "''")
    )
}

pub fn register_by_family(id: &str) -> String {
    format!(
        "Add-AppxPackage -RegisterByFamilyName -MainPackage {}",
        quote(id)
    )
}

pub fn repair_package_store() -> String {
    "Start-Process -FilePath 'wsreset.exe'".to_string()
}

pub fn checkpoint_service_status() -> String {
    format!(
        "if ((Get-Service -Name {}).Status -eq 'Running') {{ '{SERVICE_RUNNING_TOKEN}' }} else {{ 'STOPPED' }}",
        quote(CHECKPOINT_SERVICE)
    )
}

pub fn start_checkpoint_service() -> String {
    format!("Start-Service -Name {}", quote(CHECKPOINT_SERVICE))
}

pub fn probe_restore_points() -> String {
    "Get-ComputerRestorePoint | Out-Null".to_string()
}

pub fn enable_restore(drive: &str) -> String {
    format!("Enable-ComputerRestore -Drive {}", quote(drive))
}

pub fn create_restore_point(description: &str) -> String {
    format!(
        "Checkpoint-Computer -Description {} -RestorePointType 'APPLICATION_UNINSTALL'",
        quote(description)
    )
}

pub fn apply_policy_tweak(tweak: &PolicyTweak) -> String {
    let key = quote(&normalize_registry_path(&tweak.key));
    format!(
        "if (-not (Test-Path -LiteralPath {key})) {{ New-Item -Path {key} -Force | Out-Null }}; \
         New-ItemProperty -LiteralPath {key} -Name {} -Value {} -PropertyType DWord -Force | Out-Null",
        quote(&tweak.value_name),
        tweak.value
    )
}

pub fn installed_packages_json() -> String {
    "@(Get-AppxPackage -AllUsers | Select-Object Name, PackageFamilyName) | ConvertTo-Json -Compress"
        .to_string()
}

pub fn recent_app_usage_json() -> String {
    format!(
        "@(Get-ItemProperty -Path {} -ErrorAction SilentlyContinue | Select-Object AppId, LastAccessedTime, LaunchCount) | ConvertTo-Json -Compress",
        quote(RECENT_APPS_KEY)
    )
}

pub fn program_inventory_events_json() -> String {
    format!(
        "@(Get-WinEvent -LogName {} -MaxEvents 1000 -ErrorAction SilentlyContinue | Where-Object {{ $_.Id -eq 500 -or $_.Id -eq 501 }} | Select-Object TimeCreated, Message) | ConvertTo-Json -Compress",
        quote(PROGRAM_INVENTORY_LOG)
    )
}
