use std::net::Ipv4Addr;

use anyhow::{bail, ensure, Context};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::outcome::{CheckContext, Explain, Failure, ProbeResult};
use crate::registry::ServiceType;
use crate::runner::Probe;
use crate::service::{Service, VerifyError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    #[default]
    A,
    #[serde(rename = "MX")]
    Mx,
}

impl RecordKind {
    fn qtype(self) -> u16 {
        match self {
            RecordKind::A => 1,
            RecordKind::Mx => 15,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DnsRecord {
    pub kind: RecordKind,
    pub domain: String,
    /// Any one of these is acceptable.
    pub answer: Vec<String>,
}

/// Asks the team's DNS server for one of the configured records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Dns {
    #[serde(flatten)]
    pub service: Service,
    pub record: Vec<DnsRecord>,
}

#[async_trait]
impl Probe for Dns {
    const TYPE: ServiceType = ServiceType::Dns;

    fn service(&self) -> &Service {
        &self.service
    }

    fn service_mut(&mut self) -> &mut Service {
        &mut self.service
    }

    fn default_port(&self) -> Option<u16> {
        Some(53)
    }

    fn validate(&mut self) -> Result<(), VerifyError> {
        if self.record.is_empty() {
            return Err(self.service.invalid("dns check has no records"));
        }
        Ok(())
    }

    async fn check(&self, ctx: &CheckContext<'_>) -> ProbeResult {
        let record = self
            .record
            .choose(&mut rand::thread_rng())
            .ok_or_else(|| Failure::new("no records configured", ""))?;
        let domain = record.domain.replace('_', ctx.team_identifier);
        let expected: Vec<String> = record
            .answer
            .iter()
            .map(|it| it.replace('_', ctx.team_identifier))
            .collect();

        let received = query(&ctx.address(), &domain, record.kind, ctx)
            .await
            .explain("error sending query")
            .map_err(|mut f| {
                f.debug = format!("record {} {:?}: {}", domain, expected, f.debug);
                f
            })?;
        if received.is_empty() {
            return Err(Failure::new(
                "no records received",
                format!("record {} -> {:?}", domain, expected),
            ));
        }
        match received
            .iter()
            .find(|got| expected.iter().any(|want| same_answer(got, want)))
        {
            Some(hit) => Ok(format!(
                "record {} returned {}. acceptable answers were: {:?}",
                domain, hit, expected
            )),
            None => Err(Failure::new(
                "incorrect answer(s) received from DNS",
                format!(
                    "record {} -> acceptable answers were: {:?}, received {:?}",
                    domain, expected, received
                ),
            )),
        }
    }
}

fn same_answer(got: &str, want: &str) -> bool {
    got.trim_end_matches('.')
        .eq_ignore_ascii_case(want.trim_end_matches('.'))
}

async fn query(
    server: &str,
    domain: &str,
    kind: RecordKind,
    ctx: &CheckContext<'_>,
) -> anyhow::Result<Vec<String>> {
    let bind = if server.starts_with('[') { "[::]:0" } else { "0.0.0.0:0" };
    let socket = UdpSocket::bind(bind).await.context("unable to open a socket")?;
    socket.connect(server).await.context("unable to reach server")?;
    let id = rand::thread_rng().gen();
    socket.send(&encode_query(id, domain, kind)?).await?;

    let mut buf = vec![0u8; 4096];
    loop {
        let len = timeout(ctx.timeout, socket.recv(&mut buf))
            .await
            .context("i/o timeout")??;
        let reply = &buf[..len];
        if reply.len() >= 2 && u16::from_be_bytes([reply[0], reply[1]]) != id {
            continue;
        }
        return decode_answers(reply, kind);
    }
}

pub(crate) fn encode_query(id: u16, domain: &str, kind: RecordKind) -> anyhow::Result<Vec<u8>> {
    let mut msg = Vec::with_capacity(32 + domain.len());
    msg.extend_from_slice(&id.to_be_bytes());
    msg.extend_from_slice(&0x0100u16.to_be_bytes()); // recursion desired
    msg.extend_from_slice(&[0, 1, 0, 0, 0, 0, 0, 0]);
    for label in domain.trim_end_matches('.').split('.') {
        ensure!(
            !label.is_empty() && label.len() < 64,
            "invalid domain {:?}",
            domain
        );
        msg.push(label.len() as u8);
        msg.extend_from_slice(label.as_bytes());
    }
    msg.push(0);
    msg.extend_from_slice(&kind.qtype().to_be_bytes());
    msg.extend_from_slice(&1u16.to_be_bytes());
    Ok(msg)
}

struct Reader<'a> {
    msg: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> anyhow::Result<&'a [u8]> {
        let slice = self
            .msg
            .get(self.pos..self.pos + n)
            .context("truncated response")?;
        self.pos += n;
        Ok(slice)
    }

    fn u16(&mut self) -> anyhow::Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn name(&mut self) -> anyhow::Result<String> {
        let (name, end) = read_name(self.msg, self.pos)?;
        self.pos = end;
        Ok(name)
    }
}

/// Decodes a possibly compressed name at `pos`, returning it and the offset just past it.
fn read_name(msg: &[u8], mut pos: usize) -> anyhow::Result<(String, usize)> {
    let mut labels = vec![];
    let mut end = None;
    for _ in 0..128 {
        let len = *msg.get(pos).context("truncated name")? as usize;
        match len {
            0 => {
                let name = labels.join(".");
                return Ok((name, end.unwrap_or(pos + 1)));
            }
            l if l & 0xC0 == 0xC0 => {
                let low = *msg.get(pos + 1).context("truncated pointer")? as usize;
                end.get_or_insert(pos + 2);
                pos = ((l & 0x3F) << 8) | low;
            }
            l => {
                let label = msg.get(pos + 1..pos + 1 + l).context("truncated label")?;
                labels.push(String::from_utf8_lossy(label).into_owned());
                pos += 1 + l;
            }
        }
    }
    bail!("name compression loop")
}

pub(crate) fn decode_answers(msg: &[u8], kind: RecordKind) -> anyhow::Result<Vec<String>> {
    let mut reader = Reader { msg, pos: 0 };
    let header = reader.take(12)?;
    let rcode = header[3] & 0x0F;
    ensure!(rcode == 0 || rcode == 3, "server returned rcode {}", rcode);
    let questions = u16::from_be_bytes([header[4], header[5]]);
    let answers = u16::from_be_bytes([header[6], header[7]]);
    for _ in 0..questions {
        reader.name()?;
        reader.take(4)?;
    }
    let mut found = vec![];
    for _ in 0..answers {
        reader.name()?;
        let rtype = reader.u16()?;
        reader.take(6)?; // class, ttl
        let rdlength = reader.u16()? as usize;
        let rdata_start = reader.pos;
        let rdata = reader.take(rdlength)?;
        if rtype != kind.qtype() {
            continue;
        }
        match kind {
            RecordKind::A if rdata.len() == 4 => {
                found.push(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]).to_string())
            }
            RecordKind::Mx if rdata.len() > 2 => {
                let (exchange, _) = read_name(msg, rdata_start + 2)?;
                found.push(exchange);
            }
            _ => bail!("malformed {:?} record", kind),
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use assertor::{assert_that, EqualityAssertion, ResultAssertion};

    use super::*;
    use crate::outcome::test_support::context;
    use crate::outcome::ProbeEnv;

    fn answer_a(query: &[u8], ip: [u8; 4]) -> Vec<u8> {
        let mut reply = query.to_vec();
        reply[2] = 0x81;
        reply[3] = 0x80;
        reply[7] = 1; // ancount
        reply.extend_from_slice(&[0xC0, 12, 0, 1, 0, 1, 0, 0, 0, 60, 0, 4]);
        reply.extend_from_slice(&ip);
        reply
    }

    #[test]
    fn decodes_compressed_mx() {
        // given
        let query = encode_query(7, "team01.local", RecordKind::Mx).unwrap();
        let mut reply = query.clone();
        reply[7] = 1;
        // name -> pointer to question, MX preference 10, exchange "mail" + pointer to question
        reply.extend_from_slice(&[0xC0, 12, 0, 15, 0, 1, 0, 0, 0, 60, 0, 9, 0, 10]);
        reply.extend_from_slice(&[4, b'm', b'a', b'i', b'l', 0xC0, 12]);

        // when
        let answers = decode_answers(&reply, RecordKind::Mx).unwrap();

        // then
        assert_that!(answers).is_equal_to(vec!["mail.team01.local".to_string()]);
    }

    #[test]
    fn pointer_loop_is_rejected() {
        let mut msg = vec![0u8; 12];
        msg.extend_from_slice(&[0xC0, 12]);

        assert_that!(read_name(&msg, 12)).is_err();
    }

    #[tokio::test]
    async fn a_record_against_local_server() {
        // given
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            for _ in 0..2 {
                let (len, peer) = server.recv_from(&mut buf).await.unwrap();
                let reply = answer_a(&buf[..len], [10, 1, 1, 53]);
                server.send_to(&reply, peer).await.unwrap();
            }
        });
        let env = ProbeEnv::default();
        let ctx = context("127.0.0.1", port, &[], &env);
        let dns = |answer: &str| Dns {
            record: vec![DnsRecord {
                kind: RecordKind::A,
                domain: "ns._.local".to_string(),
                answer: vec![answer.to_string()],
            }],
            ..Default::default()
        };

        // when
        let right = dns("10.1.1.53").check(&ctx).await;
        let wrong = dns("10.9.9.9").check(&ctx).await;

        // then
        assert_that!(right).is_ok();
        assert_that!(wrong.unwrap_err().error)
            .is_equal_to("incorrect answer(s) received from DNS".to_string());
    }
}
