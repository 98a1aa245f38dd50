//! MPI command-line construction.

use std::fmt;
use std::path::PathBuf;

use ofanas_core::{LauncherConfig, TaskType};

/// Comma-separated `host:slots` list passed to `mpirun -H`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostList(String);

impl HostList {
    /// `["h1", "h2"]` with 2 slots each becomes `h1:2,h2:2`.
    pub fn from_nodes<S: AsRef<str>>(nodes: &[S], slots_per_node: u32) -> Self {
        let hosts: Vec<String> = nodes
            .iter()
            .map(|n| format!("{}:{slots_per_node}", n.as_ref().trim()))
            .collect();
        HostList(hosts.join(","))
    }

    /// Use an operator-supplied list verbatim.
    pub fn raw(hosts: impl Into<String>) -> Self {
        HostList(hosts.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of hosts named in the list.
    pub fn node_count(&self) -> usize {
        self.0.split(',').filter(|h| !h.trim().is_empty()).count()
    }
}

impl fmt::Display for HostList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything needed to start one training job.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRequest {
    pub task: TaskType,
    pub name: String,
    pub node_count: usize,
    pub hosts: HostList,
    pub batch_size: u32,
    pub learning_rate: f64,
}

impl LaunchRequest {
    /// A request on `nodes` with the task's default hyperparameters.
    pub fn on_nodes<S: AsRef<str>>(
        task: TaskType,
        name: impl Into<String>,
        nodes: &[S],
        slots_per_node: u32,
    ) -> Self {
        Self {
            task,
            name: name.into(),
            node_count: nodes.len(),
            hosts: HostList::from_nodes(nodes, slots_per_node),
            batch_size: task.default_batch_size(),
            learning_rate: task.default_learning_rate(),
        }
    }

    /// A request on an explicit host list; one node per listed host.
    pub fn on_hosts(task: TaskType, name: impl Into<String>, hosts: HostList) -> Self {
        Self {
            task,
            name: name.into(),
            node_count: hosts.node_count(),
            hosts,
            batch_size: task.default_batch_size(),
            learning_rate: task.default_learning_rate(),
        }
    }
}

/// Builds `mpirun` invocations from the launcher settings.
#[derive(Debug, Clone)]
pub struct MpiLauncher {
    config: LauncherConfig,
}

impl MpiLauncher {
    pub fn new(config: LauncherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    pub fn working_dir(&self) -> Option<&PathBuf> {
        self.config.root_dir.as_ref()
    }

    pub fn process_count(&self, node_count: usize) -> usize {
        node_count * self.config.slots_per_node as usize
    }

    /// The fixed part of every invocation: launcher path, process binding
    /// and the interconnect settings.
    pub fn prefix(&self) -> Vec<String> {
        let c = &self.config;
        let mpi_home = c.mpi_home.display().to_string();
        let iface = c.network_interface.as_str();
        let mut argv = vec![c.mpirun().display().to_string()];
        if c.allow_run_as_root {
            argv.push("--allow-run-as-root".into());
        }
        argv.extend(
            [
                "--prefix",
                mpi_home.as_str(),
                "-bind-to",
                "none",
                "-map-by",
                "slot",
                "-x",
                "LD_LIBRARY_PATH",
                "-x",
                "NCCL_DEBUG=INFO",
            ]
            .map(String::from),
        );
        let (ib_disable, btl, allow_ib) = if c.rdma {
            ("0", "openib,vader,self", "1")
        } else {
            ("1", "^openib", "0")
        };
        argv.extend([
            "-x".to_string(),
            format!("NCCL_IB_DISABLE={ib_disable}"),
            "-x".to_string(),
            format!("NCCL_SOCKET_IFNAME={iface}"),
            "-mca".to_string(),
            "pml".to_string(),
            "ob1".to_string(),
            "-mca".to_string(),
            "btl".to_string(),
            btl.to_string(),
            "-mca".to_string(),
            "btl_openib_allow_ib".to_string(),
            allow_ib.to_string(),
            "-mca".to_string(),
            "btl_tcp_if_include".to_string(),
            iface.to_string(),
        ]);
        argv.extend(c.extra_args.iter().cloned());
        argv
    }

    /// Full argv: prefix, process count, hosts, interpreter, entry script
    /// and hyperparameters.
    pub fn command(&self, request: &LaunchRequest) -> Vec<String> {
        let mut argv = self.prefix();
        argv.extend([
            "-np".to_string(),
            self.process_count(request.node_count).to_string(),
            "-H".to_string(),
            request.hosts.to_string(),
            self.config.python.display().to_string(),
            "-W".to_string(),
            "ignore".to_string(),
            request.task.entry_script().to_string(),
            "--lr".to_string(),
            request.learning_rate.to_string(),
            "--bs".to_string(),
            request.batch_size.to_string(),
            "--name".to_string(),
            request.name.clone(),
        ]);
        argv
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn launcher(rdma: bool) -> MpiLauncher {
        MpiLauncher::new(LauncherConfig {
            mpi_home: PathBuf::from("/opt/openmpi"),
            python: PathBuf::from("/opt/conda/bin/python"),
            network_interface: "bond1".into(),
            rdma,
            ..LauncherConfig::default()
        })
    }

    fn flag_value<'a>(argv: &'a [String], flag: &str) -> Option<&'a str> {
        argv.iter()
            .position(|a| a == flag)
            .and_then(|i| argv.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_host_list_from_nodes() {
        assert_eq!(HostList::from_nodes(&["host1", "host2"], 2).as_str(), "host1:2,host2:2");
        assert_eq!(HostList::from_nodes::<&str>(&[], 2).as_str(), "");
    }

    #[test]
    fn test_command_for_class_job() {
        let request = LaunchRequest::on_nodes(TaskType::Class, "expA", &["h1", "h2"], 2);
        let argv = launcher(false).command(&request);

        assert_eq!(argv[0], "/opt/openmpi/bin/mpirun");
        assert_eq!(flag_value(&argv, "--prefix"), Some("/opt/openmpi"));
        assert_eq!(flag_value(&argv, "-np"), Some("4"));
        assert_eq!(flag_value(&argv, "-H"), Some("h1:2,h2:2"));
        let tail: Vec<&str> = argv[argv.len() - 10..].iter().map(String::as_str).collect();
        assert_eq!(
            tail,
            vec![
                "/opt/conda/bin/python",
                "-W",
                "ignore",
                "train_ofa_net.py",
                "--lr",
                "0.04",
                "--bs",
                "16",
                "--name",
                "expA",
            ]
        );
    }

    #[test]
    fn test_raw_host_list_sets_process_count() {
        let hosts = HostList::raw("gpu1:2, gpu2:2,gpu3:2,");
        assert_eq!(hosts.node_count(), 3);
        assert_eq!(HostList::raw("").node_count(), 0);

        let request = LaunchRequest::on_hosts(TaskType::Class, "expA", hosts);
        assert_eq!(request.node_count, 3);
        let argv = launcher(false).command(&request);
        assert_eq!(flag_value(&argv, "-np"), Some("6"));
        assert_eq!(flag_value(&argv, "-H"), Some("gpu1:2, gpu2:2,gpu3:2,"));
    }

    #[test]
    fn test_stereo_defaults() {
        let request = LaunchRequest::on_nodes(TaskType::Stereo, "s1", &["h1"], 2);
        let argv = launcher(false).command(&request);
        assert_eq!(flag_value(&argv, "-np"), Some("2"));
        assert_eq!(flag_value(&argv, "--lr"), Some("0.001"));
        assert_eq!(flag_value(&argv, "--bs"), Some("1"));
        assert!(argv.iter().any(|a| a == "train_ofa_stereo.py"));
    }

    #[test]
    fn test_ethernet_and_rdma_flags() {
        let eth = launcher(false).prefix();
        assert!(eth.contains(&"NCCL_IB_DISABLE=1".to_string()));
        assert_eq!(flag_value(&eth, "btl"), Some("^openib"));
        assert_eq!(flag_value(&eth, "btl_openib_allow_ib"), Some("0"));
        assert_eq!(flag_value(&eth, "btl_tcp_if_include"), Some("bond1"));
        assert!(eth.contains(&"NCCL_SOCKET_IFNAME=bond1".to_string()));

        let rdma = launcher(true).prefix();
        assert!(rdma.contains(&"NCCL_IB_DISABLE=0".to_string()));
        assert_eq!(flag_value(&rdma, "btl"), Some("openib,vader,self"));
        assert_eq!(flag_value(&rdma, "btl_openib_allow_ib"), Some("1"));
        assert!(!rdma.contains(&"--allow-run-as-root".to_string()));
    }

    #[test]
    fn test_root_and_extra_args() {
        let launcher = MpiLauncher::new(LauncherConfig {
            allow_run_as_root: true,
            extra_args: vec!["--oversubscribe".into()],
            ..LauncherConfig::default()
        });
        let prefix = launcher.prefix();
        assert_eq!(prefix[1], "--allow-run-as-root");
        assert_eq!(prefix.last().map(String::as_str), Some("--oversubscribe"));
        assert_eq!(launcher.process_count(3), 6);
    }
}
