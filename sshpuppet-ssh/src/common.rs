/// `direct-tcpip` channel-open payload (RFC 4254 §7.2). `dest_addr` carries
/// the puppet name rather than a host address — see the local-forward gate.
#[derive(Debug, Clone)]
pub struct DirectTcpIpParams {
    pub dest_addr: String,
    pub dest_port: u32,
    pub originator_addr: String,
    pub originator_port: u32,
}
