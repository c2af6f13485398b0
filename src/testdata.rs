//! Shared test fixtures: devices and OTPs generated with yubico-c's
//! `ykgenerate`, session counters incrementing from 1.

use crate::store::{MemoryStore, UserStore, YubiUser};

/// A single test device with a few of its OTPs.
pub struct TestToken {
    /// Yubikey id (public key prefix).
    pub public: &'static str,
    /// The device's AES-128 secret, hex.
    pub secret: &'static str,
    /// OTPs (without the public leader), in press order.
    pub otps: [&'static str; 5],
}

impl TestToken {
    /// The full token as the user's press would emit it: public id + OTP.
    pub fn token(&self, i: usize) -> String {
        format!("{}{}", self.public, self.otps[i])
    }
}

pub const TEST_TOKENS: [TestToken; 5] = [
    TestToken {
        public: "6782a7960cf0",
        secret: "9a781c53532db8eb0c51ed87188cae98",
        otps: [
            "jhvhgtetkdektuiucfgijuitkjjtdngt",
            "ffhdggktgrknbdiljhrvntvecgjidbcg",
            "ugecurgeghjlhheejifherejlrrkhhcf",
            "vcgreechrrkhfnrrltjnrbvdjjtrujlf",
            "gcnvtdhlrvvektrnhlunlhthitughrlg",
        ],
    },
    TestToken {
        public: "8e76172284d4",
        secret: "4cf039957d01a7a11ce59b6c10d27d50",
        otps: [
            "iruikbviungfulfgjldibvjecgfgfvdf",
            "reeblctrdjutvnkhhtiunltignncibeb",
            "lvntfdcfkhujgnvrklkvcknfvcgvtnic",
            "chugnnetdbndbrlfuhbcvgujffbuehtk",
            "ucblkhnkktgjncvfdvuijehchgbljbdh",
        ],
    },
    TestToken {
        public: "34af90f2ab88",
        secret: "57724f2129d41cfe110da556fc680340",
        otps: [
            "erhlblrbrlrbndlgknrurftkkbldbjtd",
            "fktetgbfkivhkvickdihgherejhlhfvn",
            "nutllbukbbdggdcdnherhlikctukcgic",
            "deeblibundeuhrcfkcvenjrhrukdnflf",
            "triugfrjuknvtlrhcrbuggkgugkdbijr",
        ],
    },
    TestToken {
        public: "1de0dc832585",
        secret: "3513c74392d6c8a384e071d8a1982d6d",
        otps: [
            "gjedegnuicnhtejkkfgfjchtcefjjebv",
            "tejkntgruuttbrfnrvhkkdbbdrvlrktn",
            "ctbvhiuhhddftcjnjneebbjvnjrflull",
            "bhilhcilfthlvkfkuhiihtfrhnjvvggr",
            "jrlthhftjigjvbkrrljulcchrrjtchkh",
        ],
    },
    TestToken {
        public: "4cb46b6cd4d2",
        secret: "22fc59b26e9f58de45531789cc5318ed",
        otps: [
            "rvtecndjgnrgfudlkvnregvbcufkrrkj",
            "chgegnirtlrdcvglturbnfrefkehefie",
            "hlfgrntggjitdkvrlehgfiunnuhibbir",
            "ddkteufutjbighkbtiebgkifeujbicvt",
            "fvbnckndilfrujviejhjbjjedjjrnvcb",
        ],
    },
];

/// A map store preloaded with every test device, enabled and zeroed, with
/// a column codec installed.
pub fn memory_store_from_test_tokens() -> MemoryStore {
    let store = MemoryStore::new();
    store.set_secret_key_provider(std::sync::Arc::new(|| "foobar".to_string()));
    for (i, tt) in TEST_TOKENS.iter().enumerate() {
        let mut user = YubiUser::new(tt.public, tt.secret);
        user.email = format!("test{i}@domain.com");
        user.description = format!("rec #{i}");
        store
            .add(&user)
            .unwrap_or_else(|e| panic!("seeding test store: {e}"));
    }
    store
}
