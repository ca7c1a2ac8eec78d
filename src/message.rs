//! The reply model shared by the master, forwarder, limiter and dispatcher.
//!
//! Sections hold [`Record`] values; the wire message is built once, at the
//! end, from the request skeleton. That keeps 0x20 case echoing and the
//! limiter's snapshot semantics trivial: a reply is plain data until it hits
//! the writer.

use domain::base::iana::Rcode;
use domain::base::message_builder::AdditionalBuilder;
use domain::base::{Message, Rtype, StreamTarget};
use domain::net::server::util::mk_builder_for_target;

use crate::cache::{rr, Record};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    /// Query name in the exact case the client sent it, dot-terminated.
    pub qname: String,
    pub qtype: Rtype,
}

#[derive(Debug, Clone)]
pub struct Reply {
    pub questions: Vec<Question>,
    pub answer: Vec<Record>,
    pub authority: Vec<Record>,
    pub additional: Vec<Record>,
    pub rcode: Rcode,
    pub authoritative: bool,
    pub recursion_available: bool,
    pub authenticated_data: bool,
    pub truncated: bool,
    /// When set, an OPT pseudo record with this UDP buffer size and the DO
    /// bit is appended to the additional section.
    pub edns: Option<u16>,
}

impl Reply {
    pub fn from_request(msg: &Message<Vec<u8>>) -> Self {
        let questions = msg
            .question()
            .flatten()
            .map(|q| Question {
                qname: rr::to_fqdn(q.qname()),
                qtype: q.qtype(),
            })
            .collect();
        Reply {
            questions,
            answer: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
            rcode: Rcode::NOERROR,
            authoritative: false,
            recursion_available: false,
            authenticated_data: false,
            truncated: false,
            edns: None,
        }
    }

    /// Appends records to the section selected by `level`: `-1` authority,
    /// `0` answer, anything else additional.
    pub fn append(&mut self, level: i32, records: Vec<Record>) {
        match level {
            -1 => self.authority.extend(records),
            0 => self.answer.extend(records),
            _ => self.additional.extend(records),
        }
    }

    /// Builds the wire message for this reply: the first `answers` answer
    /// records, the authority section if requested, the additional section
    /// and the OPT record.
    pub fn build(
        &self,
        request: &Message<Vec<u8>>,
        answers: usize,
        with_authority: bool,
    ) -> Result<AdditionalBuilder<StreamTarget<Vec<u8>>>> {
        let builder = mk_builder_for_target();
        let mut answer = builder
            .start_answer(request, self.rcode)
            .map_err(|_| error!(PushRecord))?;
        {
            let header = answer.header_mut();
            header.set_aa(self.authoritative);
            header.set_ra(self.recursion_available);
            header.set_ad(self.authenticated_data);
            header.set_tc(self.truncated);
        }
        for record in self.answer.iter().take(answers) {
            answer
                .push(rr::scan_record(&rr::record_to_line(record))?)
                .map_err(|_| error!(PushRecord))?;
        }

        let mut authority = answer.authority();
        if with_authority {
            for record in &self.authority {
                authority
                    .push(rr::scan_record(&rr::record_to_line(record))?)
                    .map_err(|_| error!(PushRecord))?;
            }
        }

        let mut additional = authority.additional();
        for record in &self.additional {
            additional
                .push(rr::scan_record(&rr::record_to_line(record))?)
                .map_err(|_| error!(PushRecord))?;
        }
        if let Some(bufsize) = self.edns {
            additional
                .opt(|opt| {
                    opt.set_udp_payload_size(bufsize);
                    opt.set_dnssec_ok(true);
                    Ok(())
                })
                .map_err(|_| error!(PushRecord))?;
        }
        Ok(additional)
    }

    /// Makes the reply fit the transport's size limit.
    ///
    /// An oversized reply first loses its whole authority section. If it
    /// still does not fit, the answer section is binary-shrunk to the largest
    /// prefix that does (minus one for margin when more than one answer is
    /// left) and, on UDP, the TC flag is raised. The returned flag reports
    /// whether answers were cut.
    pub fn fit(
        &mut self,
        request: &Message<Vec<u8>>,
        size: usize,
        tcp: bool,
    ) -> Result<(AdditionalBuilder<StreamTarget<Vec<u8>>>, bool)> {
        let full = self.build(request, self.answer.len(), true)?;
        if wire_len(&full) <= size {
            return Ok((full, false));
        }

        // Drop the authority section entirely and retry.
        self.authority.clear();
        let trimmed = self.build(request, self.answer.len(), false)?;
        if wire_len(&trimmed) <= size {
            return Ok((trimmed, false));
        }

        // With TCP, setting TC would not mean anything.
        if !tcp {
            self.truncated = true;
        }

        let mut lo = 0;
        let mut hi = self.answer.len();
        while lo < hi {
            let mid = (lo + hi + 1) / 2;
            let candidate = self.build(request, mid, false)?;
            if wire_len(&candidate) <= size {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        if lo > 1 {
            lo -= 1;
        }
        self.answer.truncate(lo);
        let shrunk = self.build(request, lo, false)?;
        Ok((shrunk, true))
    }
}

fn wire_len(builder: &AdditionalBuilder<StreamTarget<Vec<u8>>>) -> usize {
    builder.as_slice().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::base::{MessageBuilder, Name};
    use std::str::FromStr;

    fn request(qname: &str, qtype: Rtype) -> Message<Vec<u8>> {
        let mut builder = MessageBuilder::new_vec();
        builder.header_mut().set_id(4711);
        let mut question = builder.question();
        question
            .push((&Name::<Vec<u8>>::from_str(qname).unwrap(), qtype))
            .unwrap();
        question.into_message()
    }

    fn a_record(name: &str, target: &str) -> Record {
        Record {
            name: name.into(),
            domain: "example.com.".into(),
            rtype: Rtype::A,
            target: target.into(),
            ttl: 60,
            online: true,
            ..Default::default()
        }
    }

    #[test]
    fn question_case_is_preserved() {
        let msg = request("Www.ExAmple.CoM", Rtype::A);
        let reply = Reply::from_request(&msg);
        assert_eq!(reply.questions.len(), 1);
        assert_eq!(reply.questions[0].qname, "Www.ExAmple.CoM.");
        assert_eq!(reply.questions[0].qtype, Rtype::A);
    }

    #[test]
    fn build_carries_sections_and_flags() {
        let msg = request("www.example.com", Rtype::A);
        let mut reply = Reply::from_request(&msg);
        reply.answer.push(a_record("www", "1.2.3.4"));
        reply.authority.push(Record {
            name: "".into(),
            domain: "example.com.".into(),
            rtype: Rtype::NS,
            target: "ns1.example.com.".into(),
            ttl: 60,
            online: true,
            ..Default::default()
        });
        reply.authoritative = true;
        reply.edns = Some(1232);

        let builder = reply.build(&msg, reply.answer.len(), true).unwrap();
        let built = Message::from_octets(builder.as_slice().to_vec()).unwrap();
        assert_eq!(built.header_counts().ancount(), 1);
        assert_eq!(built.header_counts().nscount(), 1);
        // OPT lives in the additional section.
        assert_eq!(built.header_counts().arcount(), 1);
        assert!(built.header().aa());
        assert_eq!(built.header().id(), 4711);
    }

    #[test]
    fn fit_drops_authority_then_shrinks_answers() {
        let msg = request("www.example.com", Rtype::A);
        let mut reply = Reply::from_request(&msg);
        for i in 0..60 {
            reply.answer.push(a_record("www", &format!("10.0.{}.{}", i / 256, i % 256)));
        }
        for i in 0..10 {
            reply.authority.push(Record {
                name: "".into(),
                domain: "example.com.".into(),
                rtype: Rtype::NS,
                target: format!("ns{}.example.com.", i),
                ttl: 60,
                online: true,
                ..Default::default()
            });
        }

        let (builder, shrunk) = reply.fit(&msg, 512, false).unwrap();
        assert!(shrunk);
        assert!(builder.as_slice().len() <= 512);
        let built = Message::from_octets(builder.as_slice().to_vec()).unwrap();
        assert!(built.header().tc());
        assert_eq!(built.header_counts().nscount(), 0);
        assert!(built.header_counts().ancount() > 0);
        assert!(built.header_counts().ancount() < 60);
    }

    #[test]
    fn fit_leaves_small_replies_alone() {
        let msg = request("www.example.com", Rtype::A);
        let mut reply = Reply::from_request(&msg);
        reply.answer.push(a_record("www", "1.2.3.4"));
        let (builder, shrunk) = reply.fit(&msg, 512, false).unwrap();
        assert!(!shrunk);
        let built = Message::from_octets(builder.as_slice().to_vec()).unwrap();
        assert!(!built.header().tc());
        assert_eq!(built.header_counts().ancount(), 1);
    }

    #[test]
    fn fit_on_tcp_does_not_set_tc() {
        let msg = request("www.example.com", Rtype::A);
        let mut reply = Reply::from_request(&msg);
        for i in 0..60 {
            reply.answer.push(a_record("www", &format!("10.1.{}.{}", i / 256, i % 256)));
        }
        let (builder, shrunk) = reply.fit(&msg, 512, true).unwrap();
        assert!(shrunk);
        let built = Message::from_octets(builder.as_slice().to_vec()).unwrap();
        assert!(!built.header().tc());
    }
}
