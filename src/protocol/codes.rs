//! Request, notification and error code spaces.
//!
//! ```text
//! 0x00-0x27   requests (client -> server)
//! 0x80-0x90   notifications (server -> client)
//! 0x0100-01FF request-level status codes (low byte travels as the status byte)
//! 0x0200-02FF connection-level error codes (local only, never on the wire)
//! ```

use std::fmt;

/// Declares a `#[repr]` code enum with wire conversions.
macro_rules! wire_codes {
    (
        $(#[$meta:meta])*
        pub enum $name:ident : $repr:ty {
            $( $(#[$vmeta:meta])* $variant:ident = $value:expr, )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr($repr)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $value, )+
        }

        impl $name {
            /// Every code in this space, in ascending order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Look up a code by its wire value.
            pub fn from_wire(value: $repr) -> Option<Self> {
                match value {
                    $( v if v == $value => Some($name::$variant), )+
                    _ => None,
                }
            }

            /// Wire value of this code.
            #[inline]
            pub fn as_wire(self) -> $repr {
                self as $repr
            }

            /// Symbolic name, used in logs.
            pub fn name(self) -> &'static str {
                match self {
                    $( $name::$variant => stringify!($variant), )+
                }
            }
        }
    };
}

wire_codes! {
    /// Request codes sent by clients.
    pub enum RequestCode: u8 {
        Identify = 0x00,
        Register = 0x01,
        Unregister = 0x02,
        ListDatabases = 0x03,
        GetIndexInfo = 0x04,
        FindClients = 0x05,
        GetPreferences = 0x06,
        SetPreferences = 0x07,
        OpenDatabase = 0x08,
        CreateDatabase = 0x09,
        CloseDatabase = 0x0A,
        CreateIndex = 0x0B,
        GetDbIndex = 0x0C,
        GetFrame = 0x0D,
        GetOldFrame = 0x0E,
        GetFillers = 0x0F,
        LockFrame = 0x10,
        UnlockFrame = 0x11,
        CreateFrame = 0x12,
        DeleteFrame = 0x13,
        RevertFrame = 0x14,
        UpdateFrame = 0x15,
        BeginTransaction = 0x16,
        EndTransaction = 0x17,
        AbortTransaction = 0x18,
        PersonalMessage = 0x19,
        BroadcastMessage = 0x1A,
        ClientMessage = 0x1B,
        TestAncestry = 0x1C,
        CheckRestrictions = 0x1D,
        IndexedRetrieval = 0x1E,
        ServerStatistics = 0x1F,
        LivenessCheck = 0x20,
        GetSystemConfig = 0x21,
        SetSystemConfig = 0x22,
        GetUserData = 0x23,
        SetUserData = 0x24,
        ProxyUpdate = 0x25,
        InheritableFacets = 0x26,
        InheritAllFillers = 0x27,
    }
}

impl RequestCode {
    /// Highest request code this implementation understands.
    pub const MAX: RequestCode = RequestCode::InheritAllFillers;

    /// Whether the sender must hold a client handle before issuing this request.
    pub fn requires_registration(self) -> bool {
        !matches!(
            self,
            RequestCode::Identify
                | RequestCode::Register
                | RequestCode::Unregister
                | RequestCode::LivenessCheck
                | RequestCode::ServerStatistics
        )
    }
}

wire_codes! {
    /// Notification codes sent by the server.
    pub enum NotificationCode: u8 {
        AreYouThere = 0x80,
        TerminatingConnection = 0x81,
        ServerGoingDown = 0x82,
        BroadcastMessage = 0x83,
        PersonalMessage = 0x84,
        ClientMessage = 0x85,
        ClientMessageTimeout = 0x86,
        FrameLocked = 0x87,
        FrameUnlocked = 0x88,
        FrameCreated = 0x89,
        FrameDeleted = 0x8A,
        FrameUpdated = 0x8B,
        CheckActivity = 0x8C,
        DiscardFrame = 0x8D,
        ProxyUpdate = 0x8E,
        PeerHandoff = 0x8F,
        NewController = 0x90,
    }
}

impl NotificationCode {
    /// Highest notification code this implementation understands.
    pub const MAX: NotificationCode = NotificationCode::NewController;

    /// Whether the recipient must answer with a Response packet.
    pub fn expects_response(self) -> bool {
        matches!(
            self,
            NotificationCode::AreYouThere
                | NotificationCode::ClientMessage
                | NotificationCode::CheckActivity
        )
    }
}

/// Returns true if `code` lies in the notification half of the code space.
#[inline]
pub fn is_notification_code(code: u8) -> bool {
    code & 0x80 != 0
}

wire_codes! {
    /// Status and error codes.
    ///
    /// The `0x01xx` band is carried on the wire as the low byte in the status
    /// field of Reply/Response packets. The `0x02xx` band describes transport
    /// failures and is only ever produced locally.
    pub enum ErrorCode: u16 {
        Success = 0x0100,
        InvalidRequest = 0x0101,
        InvalidParameters = 0x0102,
        NotRegistered = 0x0103,
        AlreadyRegistered = 0x0104,
        TooManyClients = 0x0105,
        AccessDenied = 0x0106,
        NoSuchDatabase = 0x0107,
        DatabaseExists = 0x0108,
        TooManyDatabases = 0x0109,
        ReadOnlyDatabase = 0x010A,
        NoSuchFrame = 0x010B,
        NoSuchSlot = 0x010C,
        FrameExists = 0x010D,
        FrameLocked = 0x010E,
        AlreadyLocked = 0x010F,
        NotLocked = 0x0110,
        TransactionPending = 0x0111,
        NoSuchTransaction = 0x0112,
        UnknownInheritanceType = 0x0113,
        NoSuchUser = 0x0114,
        NoSuchClient = 0x0115,
        ResourceLimit = 0x0116,
        ProtocolError = 0x0117,
        NoSuchConnection = 0x0200,
        AlreadyConnected = 0x0201,
        Timeout = 0x0202,
        NoSuchServer = 0x0203,
        SocketError = 0x0204,
        NotAServer = 0x0205,
    }
}

impl ErrorCode {
    /// Byte carried in the status field of a Reply/Response header.
    ///
    /// Connection-level codes are never sent; they collapse to `ProtocolError`.
    pub fn to_status_byte(self) -> u8 {
        if self.is_connection_level() {
            return ErrorCode::ProtocolError.to_status_byte();
        }
        (self.as_wire() & 0x00FF) as u8
    }

    /// Inverse of [`ErrorCode::to_status_byte`]. Unknown bytes map to `ProtocolError`.
    pub fn from_status_byte(byte: u8) -> Self {
        ErrorCode::from_wire(0x0100 | u16::from(byte)).unwrap_or(ErrorCode::ProtocolError)
    }

    #[inline]
    pub fn is_success(self) -> bool {
        self == ErrorCode::Success
    }

    /// True for the `0x02xx` transport band.
    #[inline]
    pub fn is_connection_level(self) -> bool {
        self.as_wire() & 0xFF00 == 0x0200
    }

    /// Human-readable description.
    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::Success => "success",
            ErrorCode::InvalidRequest => "invalid request",
            ErrorCode::InvalidParameters => "invalid parameters",
            ErrorCode::NotRegistered => "client not registered",
            ErrorCode::AlreadyRegistered => "client already registered",
            ErrorCode::TooManyClients => "too many clients",
            ErrorCode::AccessDenied => "access denied",
            ErrorCode::NoSuchDatabase => "no such database",
            ErrorCode::DatabaseExists => "database already exists",
            ErrorCode::TooManyDatabases => "too many open databases",
            ErrorCode::ReadOnlyDatabase => "database is read-only",
            ErrorCode::NoSuchFrame => "no such frame",
            ErrorCode::NoSuchSlot => "no such slot",
            ErrorCode::FrameExists => "frame already exists",
            ErrorCode::FrameLocked => "frame is locked",
            ErrorCode::AlreadyLocked => "frame already locked",
            ErrorCode::NotLocked => "frame not locked",
            ErrorCode::TransactionPending => "transaction pending",
            ErrorCode::NoSuchTransaction => "no such transaction",
            ErrorCode::UnknownInheritanceType => "unknown inheritance type",
            ErrorCode::NoSuchUser => "no such user",
            ErrorCode::NoSuchClient => "no such client",
            ErrorCode::ResourceLimit => "resource limit reached",
            ErrorCode::ProtocolError => "protocol error",
            ErrorCode::NoSuchConnection => "no such connection",
            ErrorCode::AlreadyConnected => "already connected",
            ErrorCode::Timeout => "timed out",
            ErrorCode::NoSuchServer => "no such server",
            ErrorCode::SocketError => "socket error",
            ErrorCode::NotAServer => "peer is not a server",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:04X})", self.description(), self.as_wire())
    }
}
