//! Feature bits a peer advertises during the availability handshake.
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Capability {
    TradeStatistics = 0,
    RefundAgent = 1,
    BsqSwapOffer = 2,
    /// Deposit protocol with pre-signed warning and redirect transactions.
    ProtocolV5 = 3,
    MailboxMessages = 4,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::TradeStatistics,
        Capability::RefundAgent,
        Capability::BsqSwapOffer,
        Capability::ProtocolV5,
        Capability::MailboxMessages,
    ];

    fn bit(self) -> u64 {
        1 << (self as u8)
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trade_statistics" => Ok(Capability::TradeStatistics),
            "refund_agent" => Ok(Capability::RefundAgent),
            "bsq_swap_offer" => Ok(Capability::BsqSwapOffer),
            "protocol_v5" => Ok(Capability::ProtocolV5),
            "mailbox_messages" => Ok(Capability::MailboxMessages),
            other => Err(format!("unknown capability '{other}'")),
        }
    }
}

/// Bitset of [`Capability`] values.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Capabilities(u64);

impl Capabilities {
    pub fn all() -> Self {
        Capability::ALL.into_iter().collect()
    }
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }
    pub fn bits(self) -> u64 {
        self.0
    }
    pub fn with(mut self, capability: Capability) -> Self {
        self.0 |= capability.bit();
        self
    }
    pub fn contains(self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }
    pub fn contains_all(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }
}

impl FromIterator<Capability> for Capabilities {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        iter.into_iter().fold(Capabilities::default(), Capabilities::with)
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(Capability::ALL.iter().filter(|c| self.contains(**c)))
            .finish()
    }
}

impl<C> minicbor::Encode<C> for Capabilities {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.u64(self.0)?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for Capabilities {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        // unknown bits from newer peers are kept, they are simply never queried
        Ok(Capabilities(d.u64()?))
    }
}
