// tandem-common: wire types shared by the Tandem relay and its clients

pub mod protocol;
